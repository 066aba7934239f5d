use std::{path::PathBuf, process, sync::Arc};

use candle_core::Device;
use structopt::StructOpt;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::*;
use uefl_core::data::Dataset;
use uefl_trainer::{
    metrics::{GlobalRecorder, Recorder, METRICS_FILE},
    settings::{Overrides, Settings},
    silo::LocalFederation,
    state_machine::{coordinator::Outcome, initializer::StateMachineInitializer},
    storage::FileStore,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "train", about = "Federated training with an extensible codebook")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, long = "config", parse(from_os_str))]
    config_path: Option<PathBuf>,
    /// The dataset: mnist or fmnist
    #[structopt(long)]
    data: Option<String>,
    /// The directory that holds the datasets
    #[structopt(long = "data_dir", parse(from_os_str))]
    data_dir: Option<PathBuf>,
    /// The number of silos
    #[structopt(long = "num_silo")]
    num_silo: Option<i64>,
    /// The number of data distributions
    #[structopt(long = "num_dist")]
    num_dist: Option<i64>,
    /// The number of training samples per silo
    #[structopt(long)]
    sample: Option<i64>,
    /// Adds Gaussian noise to the images of the silos with an index above 5
    #[structopt(long)]
    noise: bool,
    /// The encoder family
    #[structopt(long)]
    encoder: Option<String>,
    /// The number of channels of the first encoder block
    #[structopt(long)]
    dim: Option<i64>,
    /// The number of encoder blocks
    #[structopt(long)]
    depth: Option<i64>,
    /// The number of codewords per codebook
    #[structopt(long = "num_codes")]
    num_codes: Option<i64>,
    /// The number of segments per feature vector
    #[structopt(long)]
    seg: Option<i64>,
    /// The number of rounds of the first iteration
    #[structopt(long)]
    round: Option<i64>,
    /// The number of rounds of every further iteration
    #[structopt(long = "round_plus")]
    round_plus: Option<i64>,
    /// The number of local epochs per round
    #[structopt(long)]
    epoch: Option<i64>,
    /// The maximal number of mini-batches per local epoch, 0 for a full pass
    #[structopt(long)]
    step: Option<i64>,
    /// The uncertainty threshold
    #[structopt(long)]
    thd: Option<f64>,
    /// The mini-batch size
    #[structopt(long = "batch_size")]
    batch_size: Option<i64>,
    /// The learning rate
    #[structopt(long)]
    lr: Option<f64>,
    /// The seed of the data shuffling, the pixel noise and k-means
    #[structopt(long)]
    seed: Option<i64>,
    /// The output directory
    #[structopt(long, parse(from_os_str))]
    workdir: Option<PathBuf>,
    /// Continues an unfinished run in the output directory
    #[structopt(long)]
    restore: bool,
}

impl Opt {
    fn overrides(&self) -> Overrides {
        let path = |path: &Option<PathBuf>| path.as_ref().map(|path| path.display().to_string());
        let mut overrides = Overrides::new();
        overrides
            .set("data.dataset", self.data.clone())
            .set("data.dir", path(&self.data_dir))
            .set("data.num_silo", self.num_silo)
            .set("data.num_dist", self.num_dist)
            .set("data.sample", self.sample)
            .set("data.noise", self.noise.then(|| true))
            .set("model.encoder", self.encoder.clone())
            .set("model.dim", self.dim)
            .set("model.depth", self.depth)
            .set("model.num_codes", self.num_codes)
            .set("model.seg", self.seg)
            .set("train.round", self.round)
            .set("train.round_plus", self.round_plus)
            .set("train.epoch", self.epoch)
            .set("train.step", self.step)
            .set("train.thd", self.thd)
            .set("train.batch_size", self.batch_size)
            .set("train.lr", self.lr)
            .set("train.seed", self.seed)
            .set("output.workdir", path(&self.workdir))
            .set("restore.enable", self.restore.then(|| true));
        overrides
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings =
        Settings::new(opt.config_path.as_deref(), opt.overrides()).unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });
    let silo_config = settings.silo_config();
    let net_config = settings.net_config();
    let Settings {
        data: data_settings,
        model: model_settings,
        train: train_settings,
        output: output_settings,
        restore: restore_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let metrics_path = output_settings.workdir.join(METRICS_FILE);
    let (recorder, dispatcher) = if restore_settings.enable {
        Recorder::appending(metrics_path)
    } else {
        Recorder::new(metrics_path)
    };
    let metrics_handle = tokio::spawn(dispatcher.run());
    if GlobalRecorder::install(recorder.clone()).is_err() {
        warn!("a metrics recorder is already installed");
    }

    info!(
        "loading {} from {}",
        data_settings.dataset,
        data_settings.dir.display()
    );
    let dataset = Dataset::open(&data_settings.dir, data_settings.dataset).unwrap_or_else(|err| {
        error!("failed to load the dataset: {}", err);
        process::exit(1);
    });
    let federation = LocalFederation::open(&dataset, &silo_config, net_config, Device::Cpu)
        .unwrap_or_else(|err| {
            error!("failed to set up the silos: {}", err);
            process::exit(1);
        });
    drop(dataset);

    let store = FileStore::in_workdir(&output_settings.workdir);
    let (state_machine, event_subscriber) = StateMachineInitializer::new(
        data_settings,
        model_settings,
        train_settings,
        restore_settings,
        Arc::new(federation),
        store,
    )
    .init()
    .await
    .unwrap_or_else(|err| {
        error!("failed to initialize the state machine: {}", err);
        process::exit(1);
    });
    let outcomes = event_subscriber.outcome_listener();

    tokio::select! {
        _ = state_machine.run() => {
            info!("state machine terminated");
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }

    // the dispatcher only stops early on write errors
    recorder.flush().await;
    if metrics_handle.is_finished() {
        if let Ok(Err(err)) = metrics_handle.await {
            error!("failed to write the metrics: {}", err);
        }
    }

    match outcomes.get_latest().event {
        Outcome::Completed => {
            info!(
                "training completed, see {}",
                output_settings.workdir.display()
            );
        }
        outcome => {
            error!("training did not complete: {}", outcome);
            process::exit(1);
        }
    }
}
