//! Bookkeeping of the extensible codebook.
//!
//! The codebook is a list of codebooks. The first one is shared by all silos. A silo that is
//! assigned the [`BookIndex`] `k > 0` quantizes against the shared codebook *and* codebook `k`.
//! A fresh registry holds a spare codebook next to the shared one, which the first extension
//! fills. Every later extension grows the list to exactly `iteration + 1` codebooks.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::common::SiloId;

/// The number of codebooks a fresh registry starts with: the shared one and a spare.
pub const INITIAL_CODEBOOKS: usize = 2;

/// Index into the list of codebooks. `0` stands for the shared codebook only.
#[derive(
    Debug, Display, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Serialize, Deserialize,
)]
#[display(fmt = "{}", _0)]
pub struct BookIndex(pub usize);

impl BookIndex {
    /// The index of the shared codebook.
    pub const SHARED: BookIndex = BookIndex(0);

    /// Checks whether this index refers to the shared codebook only.
    pub fn is_shared(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The codebooks of the federation and the codebook assignments of the silos.
pub struct CodebookRegistry {
    num_codebooks: usize,
    assignments: Vec<BookIndex>,
}

impl CodebookRegistry {
    /// Creates a registry for `num_silos` silos which all use the shared codebook.
    pub fn new(num_silos: usize) -> Self {
        Self {
            num_codebooks: INITIAL_CODEBOOKS,
            assignments: vec![BookIndex::SHARED; num_silos],
        }
    }

    /// Gets the number of codebooks.
    pub fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }

    /// Gets the number of silos.
    pub fn num_silos(&self) -> usize {
        self.assignments.len()
    }

    /// Makes sure that the codebook for the given extension `iteration` exists and returns its
    /// index.
    pub fn ensure_codebook(&mut self, iteration: usize) -> BookIndex {
        if iteration >= self.num_codebooks {
            self.num_codebooks = iteration + 1;
        }
        BookIndex(iteration)
    }

    /// Assigns the codebook `book` to the given silo.
    ///
    /// # Panics
    /// Panics if the silo or the codebook is unknown.
    pub fn assign(&mut self, silo: SiloId, book: BookIndex) {
        assert!(book.0 < self.num_codebooks, "unknown codebook {}", book);
        self.assignments[silo.0] = book;
    }

    /// Gets the codebook assigned to the given silo.
    pub fn book(&self, silo: SiloId) -> BookIndex {
        self.assignments[silo.0]
    }

    /// Gets the silos that are assigned to the given codebook.
    pub fn silos_of(&self, book: BookIndex) -> impl Iterator<Item = SiloId> + '_ {
        self.assignments
            .iter()
            .enumerate()
            .filter(move |(_, b)| **b == book)
            .map(|(i, _)| SiloId(i))
    }

    /// Gets all codebook assignments, indexed by silo.
    pub fn assignments(&self) -> &[BookIndex] {
        &self.assignments
    }
}
