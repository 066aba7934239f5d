use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// The identifier of a silo, i.e. its position in the federation.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Serialize, Deserialize,
)]
#[display(fmt = "silo-{}", _0)]
pub struct SiloId(pub usize);

/// The round parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundParameters {
    /// The codebook iteration the round belongs to.
    pub iteration: usize,
    /// The global round counter, starting at `1` for the first round.
    pub round_id: u64,
    /// The number of local epochs every silo trains for.
    pub local_epochs: usize,
    /// The maximal number of mini-batches per local epoch. `0` means a full pass.
    pub steps: usize,
    /// The mini-batch size.
    pub batch_size: usize,
    /// The learning rate of the local optimizer.
    pub lr: f64,
    /// The seed from which the local shuffling is derived.
    pub seed: u64,
}

impl RoundParameters {
    /// Derives a seed that is unique for this round and the given silo.
    pub fn silo_seed(&self, silo: SiloId) -> u64 {
        self.seed
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(self.round_id << 16)
            .wrapping_add(silo.0 as u64)
    }
}
