//! Pluggable scoring for index queries.
//!
//! A search function scores a candidate from four set sizes (query,
//! shared, subject, union), decides whether the score passes, and may
//! update its own state as results are collected (best-only search
//! ratchets its threshold upward).

use crate::sketch::minhash::KmerMinHash;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Jaccard,
    Containment,
    MaxContainment,
}

#[derive(Debug, Clone)]
pub struct JaccardSearch {
    search_type: SearchType,
    threshold: f64,
    best_only: bool,
}

impl JaccardSearch {
    pub fn new(search_type: SearchType, threshold: f64) -> Self {
        JaccardSearch {
            search_type,
            threshold,
            best_only: false,
        }
    }

    /// Keep only the best result; collected scores raise the threshold.
    pub fn with_best_only(mut self) -> Self {
        self.best_only = true;
        self
    }

    pub fn search_type(&self) -> SearchType {
        self.search_type
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn best_only(&self) -> bool {
        self.best_only
    }

    /// Containment-family searches need scaled sketches; a num sketch has
    /// no usable denominator.
    pub fn check_is_compatible(&self, query: &KmerMinHash) -> Result<()> {
        match self.search_type {
            SearchType::Jaccard => Ok(()),
            SearchType::Containment | SearchType::MaxContainment => {
                if query.max_hash() == 0 {
                    Err(Error::NeedsScaled {
                        message: "containment search".into(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn score(&self, query_size: usize, shared: usize, subj_size: usize, total_size: usize) -> f64 {
        let shared = shared as f64;
        match self.search_type {
            SearchType::Jaccard => shared / usize::max(1, total_size) as f64,
            SearchType::Containment => shared / usize::max(1, query_size) as f64,
            SearchType::MaxContainment => {
                shared / usize::max(1, usize::min(query_size, subj_size)) as f64
            }
        }
    }

    pub fn passes(&self, score: f64) -> bool {
        score > 0.0 && score >= self.threshold
    }

    pub fn collect(&mut self, score: f64) {
        if self.best_only && score > self.threshold {
            self.threshold = score;
        }
    }
}

/// Convert a bp-denominated prefetch threshold into a hash count at the
/// given scaled.
pub fn prefetch_threshold_hashes(threshold_bp: u64, scaled: u64) -> u64 {
    if scaled == 0 {
        return 0;
    }
    threshold_bp / scaled
}
