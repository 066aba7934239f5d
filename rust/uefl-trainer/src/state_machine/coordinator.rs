//! Coordinator state and schedule types.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    settings::{DataSettings, ModelSettings, TrainSettings},
    silo::SiloEvaluation,
};
use uefl_core::{BookIndex, CodebookRegistry, RoundParameters, SiloId};

/// The parameters that decide how long training goes on and when the codebook grows.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// The number of rounds of the first iteration.
    pub round: usize,
    /// The number of rounds of every further iteration.
    pub round_plus: usize,
    /// The number of data distributions, which caps the number of iterations.
    pub num_dist: usize,
    /// The uncertainty above which a silo gets an extension codebook.
    pub thd: f64,
    /// The number of codewords per codebook.
    pub num_codes: usize,
    /// The seed of the codebook initialisation.
    pub seed: u64,
}

impl Schedule {
    /// Gets the number of rounds of the given iteration.
    pub fn rounds_for(&self, iteration: usize) -> usize {
        if iteration == 0 {
            self.round
        } else {
            self.round_plus
        }
    }

    /// Checks whether the silo of the given evaluation needs an extension codebook.
    pub fn is_uncertain(&self, evaluation: &SiloEvaluation) -> bool {
        evaluation.uncertainty > self.thd
    }
}

/// The outcome of an iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// The round after which the silos were evaluated.
    pub round_id: u64,
    pub num_codebooks: usize,
    pub evaluations: Vec<SiloEvaluation>,
    /// The silos whose uncertainty exceeded the threshold.
    pub uncertain: Vec<SiloId>,
}

impl IterationRecord {
    pub fn mean_accuracy(&self) -> f64 {
        mean(self.evaluations.iter().map(|evaluation| evaluation.accuracy))
    }

    pub fn mean_uncertainty(&self) -> f64 {
        mean(self.evaluations.iter().map(|evaluation| evaluation.uncertainty))
    }
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        0.
    } else {
        values.sum::<f64>() / n as f64
    }
}

/// The coordinator state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// Internal ID used to identify a round. The first round has the ID `1`.
    pub round_id: u64,
    /// The current codebook iteration.
    pub iteration: usize,
    /// The number of aggregated rounds of the current iteration.
    pub round_in_iteration: usize,
    /// The codebooks and the codebook assignments of the silos.
    pub registry: CodebookRegistry,
    /// The round parameters.
    pub round_params: RoundParameters,
    pub schedule: Schedule,
    /// The evaluations of all finished iterations.
    pub history: Vec<IterationRecord>,
    /// The id of the latest stored global model.
    pub latest_model_id: Option<String>,
    /// Whether the run has finished successfully.
    pub completed: bool,
}

impl CoordinatorState {
    pub fn new(
        data_settings: &DataSettings,
        model_settings: &ModelSettings,
        train_settings: &TrainSettings,
    ) -> Self {
        let round_params = RoundParameters {
            iteration: 0,
            round_id: 0,
            local_epochs: train_settings.epoch,
            steps: train_settings.step,
            batch_size: train_settings.batch_size,
            lr: train_settings.lr,
            seed: train_settings.seed,
        };
        let schedule = Schedule {
            round: train_settings.round,
            round_plus: train_settings.round_plus,
            num_dist: data_settings.num_dist,
            thd: train_settings.thd,
            num_codes: model_settings.num_codes,
            seed: train_settings.seed,
        };
        Self {
            round_id: 0,
            iteration: 0,
            round_in_iteration: 0,
            registry: CodebookRegistry::new(data_settings.num_silo),
            round_params,
            schedule,
            history: Vec::new(),
            latest_model_id: None,
            completed: false,
        }
    }

    /// Checks whether the current iteration has run all its rounds.
    pub fn is_iteration_done(&self) -> bool {
        self.round_in_iteration >= self.schedule.rounds_for(self.iteration)
    }

    /// Creates the summary of the run.
    pub fn summary(&self, outcome: Outcome) -> Summary {
        Summary {
            outcome,
            rounds: self.round_id,
            iterations: self.iteration + 1,
            num_codebooks: self.registry.num_codebooks(),
            assignments: self.registry.assignments().to_vec(),
            latest_model_id: self.latest_model_id.clone(),
            history: self.history.clone(),
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, Display, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum Outcome {
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "failed: {}", _0)]
    Failed(String),
}

/// The summary of a finished run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub outcome: Outcome,
    /// The number of federated rounds.
    pub rounds: u64,
    /// The number of codebook iterations.
    pub iterations: usize,
    pub num_codebooks: usize,
    /// The book index of every silo.
    pub assignments: Vec<BookIndex>,
    pub latest_model_id: Option<String>,
    pub history: Vec<IterationRecord>,
}
