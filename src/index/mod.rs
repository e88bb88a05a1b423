//! # Indexed collections and the search / prefetch / gather engine
//!
//! An index organizes signatures to allow for fast similarity and
//! containment search. All backends share one query surface: `find`
//! (filter every stored sketch through a search function), `search`
//! (scored and sorted), `prefetch` (every candidate above a bp-overlap
//! threshold) and `gather` (iterative greedy decomposition).

pub mod linear;
pub mod search;
pub mod sqlite;

use std::collections::BinaryHeap;

use enum_dispatch::enum_dispatch;
use getset::{CopyGetters, Getters};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::ani_utils::ani_from_containment;
use crate::encodings::Idx;
use crate::index::search::{prefetch_threshold_hashes, JaccardSearch};
use crate::selection::Selection;
use crate::signature::{Signature, SigsTrait};
use crate::sketch::minhash::KmerMinHash;
use crate::Result;

pub use crate::index::linear::LinearIndex;
pub use crate::index::sqlite::SqliteIndex;

pub type SigCounter = counter::Counter<Idx>;

/// One scored match from `find`/`search`.
#[derive(Debug, Clone)]
pub struct IndexSearchResult {
    pub score: f64,
    pub signature: Signature,
    pub location: String,
}

/// A candidate with enough bp overlap to participate in gather.
#[derive(Debug, Clone)]
pub struct PrefetchResult {
    pub name: String,
    pub md5: String,
    pub location: String,
    pub minhash: KmerMinHash,
    pub signature: Signature,
    pub overlap: u64,
}

impl Ord for PrefetchResult {
    fn cmp(&self, other: &PrefetchResult) -> std::cmp::Ordering {
        // max-heap by overlap; equal overlaps order by md5 so iteration
        // order is deterministic
        self.overlap
            .cmp(&other.overlap)
            .then_with(|| other.md5.cmp(&self.md5))
    }
}

impl PartialOrd for PrefetchResult {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PrefetchResult {
    fn eq(&self, other: &Self) -> bool {
        self.overlap == other.overlap && self.md5 == other.md5
    }
}

impl Eq for PrefetchResult {}

/// The uniform query surface over index backends.
#[enum_dispatch]
pub trait Index {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn location(&self) -> Option<String>;

    /// All stored signatures.
    fn signatures(&self) -> Result<Vec<Signature>>;

    fn signatures_with_location(&self) -> Result<Vec<(Signature, String)>>;

    /// Filter every stored sketch through `search_fn`, after downsampling
    /// the query to the backend's resolution as needed.
    fn find(&self, search_fn: &mut JaccardSearch, query: &KmerMinHash)
        -> Result<Vec<IndexSearchResult>>;

    /// Scored search, sorted by descending score. With a best-only search
    /// function only the best match is returned.
    fn search(
        &self,
        search_fn: &mut JaccardSearch,
        query: &KmerMinHash,
    ) -> Result<Vec<IndexSearchResult>> {
        let best_only = search_fn.best_only();
        let mut results = self.find(search_fn, query)?;
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.signature.name().cmp(&b.signature.name()))
        });
        if best_only {
            results.truncate(1);
        }
        Ok(results)
    }

    /// Every stored sketch whose overlap with the query is at least
    /// `threshold_bp`, largest overlap first. The query is not mutated.
    fn prefetch(&self, query: &KmerMinHash, threshold_bp: u64) -> Result<Vec<PrefetchResult>>;

    /// Build the gather collaborator from prefetch candidates.
    fn counter_gather(&self, query: &KmerMinHash, threshold_bp: u64) -> Result<CounterGather> {
        let mut counter = CounterGather::new();
        for result in self.prefetch(query, threshold_bp)? {
            counter.add(result);
        }
        Ok(counter)
    }

    /// Iteratively decompose `query` into a minimum cover of stored
    /// sketches.
    fn gather(&self, query: &KmerMinHash, threshold_bp: u64) -> Result<Vec<GatherResult>> {
        let mut counter = self.counter_gather(query, threshold_bp)?;
        gather_with_counter(query, &mut counter, threshold_bp)
    }
}

#[enum_dispatch(Index)]
pub enum DbIndex {
    Linear(LinearIndex),
    Sqlite(SqliteIndex),
}

impl crate::selection::Select for DbIndex {
    fn select(self, selection: &Selection) -> Result<Self> {
        use crate::selection::Select as _;
        Ok(match self {
            DbIndex::Linear(idx) => DbIndex::Linear(idx.select(selection)?),
            DbIndex::Sqlite(idx) => DbIndex::Sqlite(idx.select(selection)?),
        })
    }
}

/// One entry of a gather decomposition.
#[derive(CopyGetters, Getters, Serialize, Deserialize, Debug, Clone, typed_builder::TypedBuilder)]
pub struct GatherResult {
    /// overlap between the match and the *original* query, in bp
    #[getset(get_copy = "pub")]
    #[builder(default)]
    intersect_bp: usize,

    /// fraction of the original query covered by this match
    #[getset(get_copy = "pub")]
    #[builder(default)]
    f_orig_query: f64,

    /// fraction of the match covered by the remaining query
    #[getset(get_copy = "pub")]
    #[builder(default)]
    f_match: f64,

    /// fraction of the match covered by the original query
    #[getset(get_copy = "pub")]
    #[builder(default)]
    f_match_orig: f64,

    /// fraction of the original query claimed by this match alone
    #[getset(get_copy = "pub")]
    #[builder(default)]
    f_unique_to_query: f64,

    /// like `f_unique_to_query`, weighted by the query's abundances
    #[getset(get_copy = "pub")]
    #[builder(default)]
    f_unique_weighted: f64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    average_abund: f64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    median_abund: f64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    std_abund: f64,

    #[getset(get = "pub")]
    #[builder(default)]
    filename: String,

    #[getset(get = "pub")]
    #[builder(default)]
    name: String,

    #[getset(get = "pub")]
    #[builder(default)]
    md5: String,

    #[builder(default)]
    match_: Signature,

    /// hashes claimed by this match alone, in bp
    #[getset(get_copy = "pub")]
    #[builder(default)]
    unique_intersect_bp: usize,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    gather_result_rank: usize,

    /// query bp left unclaimed after this match
    #[getset(get_copy = "pub")]
    #[builder(default)]
    remaining_bp: usize,

    /// ANI implied by this match's containment of the query
    #[getset(get_copy = "pub")]
    #[builder(default)]
    query_containment_ani: f64,

    /// running sum of abundance-weighted claimed hashes
    #[getset(get_copy = "pub")]
    #[builder(default)]
    sum_weighted_found: u64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    total_weighted_hashes: u64,
}

impl GatherResult {
    pub fn get_match(&self) -> Signature {
        self.match_.clone()
    }
}

/// Answers "which subject has the biggest remaining intersection" without
/// re-scanning the backend each iteration.
///
/// Backends feed it prefetch candidates; `peek` returns the current best
/// match and its intersection with the remaining query, and `consume`
/// retires claimed hashes from every candidate's count.
#[derive(Default)]
pub struct CounterGather {
    counter: SigCounter,
    candidates: Vec<PrefetchResult>,
}

impl CounterGather {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, candidate: PrefetchResult) {
        let idx = self.candidates.len() as Idx;
        self.counter[&idx] += candidate.overlap as usize;
        self.candidates.push(candidate);
    }

    pub fn is_empty(&self) -> bool {
        self.counter.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counter.len()
    }

    /// Largest scaled over all candidates, for choosing a common
    /// resolution with the query.
    pub fn scaled(&self) -> u64 {
        self.candidates
            .iter()
            .map(|c| c.minhash.scaled())
            .max()
            .unwrap_or(0)
    }

    /// Bring every candidate to `scaled` and recompute overlap counts
    /// against the (already downsampled) query.
    fn prepare(&mut self, query: &KmerMinHash, scaled: u64) -> Result<()> {
        self.counter.clear();
        for (i, candidate) in self.candidates.iter_mut().enumerate() {
            if candidate.minhash.scaled() != scaled {
                candidate.minhash = candidate.minhash.downsample_scaled(scaled)?;
            }
            let overlap = query.count_common(&candidate.minhash, false)?;
            candidate.overlap = overlap;
            if overlap > 0 {
                self.counter[&(i as Idx)] += overlap as usize;
            }
        }
        Ok(())
    }

    /// Best candidate for the remaining query: highest overlap, ties
    /// broken by ascending md5. Returns the candidate index and the
    /// intersection sketch, or `None` when nothing reaches
    /// `threshold_hashes`.
    pub fn peek(
        &self,
        remaining: &KmerMinHash,
        threshold_hashes: u64,
    ) -> Result<Option<(Idx, KmerMinHash)>> {
        if remaining.is_empty() || self.counter.is_empty() {
            return Ok(None);
        }

        let best = self
            .counter
            .iter()
            .filter(|(_, count)| **count > 0)
            .max_by(|(a_idx, a_count), (b_idx, b_count)| {
                a_count.cmp(b_count).then_with(|| {
                    // reversed: lower md5 wins ties
                    self.candidates[**b_idx as usize]
                        .md5
                        .cmp(&self.candidates[**a_idx as usize].md5)
                })
            })
            .map(|(idx, _)| *idx);

        let best_idx = match best {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let match_mh = &self.candidates[best_idx as usize].minhash;
        let isect = remaining.intersection_sketch(match_mh)?;

        if isect.is_empty() || (isect.size() as u64) < u64::max(threshold_hashes, 1) {
            return Ok(None);
        }

        Ok(Some((best_idx, isect)))
    }

    /// Retire claimed hashes: decrement the count of every candidate that
    /// shares hashes with `intersect`, and drop exhausted candidates.
    pub fn consume(&mut self, intersect: &KmerMinHash) -> Result<()> {
        let mut exhausted = vec![];
        for (idx, count) in self.counter.iter_mut() {
            let candidate = &self.candidates[*idx as usize];
            let shared = intersect.count_common(&candidate.minhash, false)? as usize;
            *count = count.saturating_sub(shared);
            if *count == 0 {
                exhausted.push(*idx);
            }
        }
        for idx in exhausted {
            self.counter.remove(&idx);
        }
        Ok(())
    }

    pub fn candidate(&self, idx: Idx) -> &PrefetchResult {
        &self.candidates[idx as usize]
    }
}

/// The gather driver: repeatedly pick the best remaining candidate,
/// record its statistics, and subtract its hashes from the query.
///
/// Results come out in non-increasing `f_unique_to_query` order; every
/// query hash is claimed by at most one result.
pub fn gather_with_counter(
    query: &KmerMinHash,
    counter: &mut CounterGather,
    threshold_bp: u64,
) -> Result<Vec<GatherResult>> {
    let mut results = vec![];
    if counter.is_empty() || query.is_empty() {
        return Ok(results);
    }

    // bring the query and all candidates to one resolution
    let scaled = u64::max(query.scaled(), counter.scaled());
    let orig_query = query.downsample_scaled(scaled)?;
    let threshold_hashes = prefetch_threshold_hashes(threshold_bp, scaled);

    let mut remaining = orig_query.flatten();
    counter.prepare(&remaining, scaled)?;
    let total_weighted_hashes = orig_query.sum_abunds();
    let orig_size = orig_query.size();
    let mut sum_weighted_found: u64 = 0;

    while let Some((best_idx, isect)) = counter.peek(&remaining, threshold_hashes)? {
        let candidate = counter.candidate(best_idx);
        let match_mh = candidate.minhash.downsample_scaled(scaled)?;

        let unique_size = isect.size();
        let (isect_orig_size, _) = match_mh.intersection_size(&orig_query.flatten())?;

        // abundance statistics over the claimed hashes, from the original
        // query
        let (weighted_claimed, average_abund, median_abund, std_abund) =
            if orig_query.track_abundance() {
                let inflated = isect.inflate(&orig_query)?;
                let abunds = inflated.abunds().unwrap_or_default();
                let weighted: u64 = abunds.iter().sum();
                let mean = stats::mean(abunds.iter().copied());
                let median = stats::median(abunds.iter().map(|a| *a as f64)).unwrap_or(0.0);
                let stddev = stats::stddev(abunds.iter().copied());
                (weighted, mean, median, stddev)
            } else {
                (unique_size as u64, 0.0, 0.0, 0.0)
            };
        sum_weighted_found += weighted_claimed;

        let f_unique_to_query = unique_size as f64 / orig_size as f64;
        let f_unique_weighted = if total_weighted_hashes == 0 {
            0.0
        } else {
            weighted_claimed as f64 / total_weighted_hashes as f64
        };

        let remaining_after = remaining.size() - unique_size;

        let result = GatherResult {
            intersect_bp: (isect_orig_size * scaled) as usize,
            f_orig_query: isect_orig_size as f64 / orig_size as f64,
            f_match: unique_size as f64 / match_mh.size() as f64,
            f_match_orig: isect_orig_size as f64 / match_mh.size() as f64,
            f_unique_to_query,
            f_unique_weighted,
            average_abund,
            median_abund,
            std_abund,
            filename: candidate.location.clone(),
            name: candidate.name.clone(),
            md5: candidate.md5.clone(),
            match_: candidate.signature.clone(),
            unique_intersect_bp: (unique_size as u64 * scaled) as usize,
            gather_result_rank: results.len(),
            remaining_bp: (remaining_after as u64 * scaled) as usize,
            query_containment_ani: ani_from_containment(
                isect_orig_size as f64 / orig_size as f64,
                orig_query.ksize() as f64,
            ),
            sum_weighted_found,
            total_weighted_hashes,
        };

        trace!(
            "gather rank {}: {} claims {} hashes",
            result.gather_result_rank,
            result.name,
            unique_size
        );
        results.push(result);

        remaining.remove_from(&isect)?;
        counter.consume(&isect)?;
    }

    Ok(results)
}

/// Split a query's hashes into the union matched by any prefetch
/// candidate and the remainder, each as a flat sketch. Useful for saving
/// prefetch output alongside the match list.
pub fn prefetch_hash_unions(
    query: &KmerMinHash,
    candidates: &[PrefetchResult],
) -> Result<(KmerMinHash, KmerMinHash)> {
    let scaled = u64::max(
        query.scaled(),
        candidates
            .iter()
            .map(|c| c.minhash.scaled())
            .max()
            .unwrap_or(0),
    );

    let query = query.downsample_scaled(scaled)?.flatten();
    let mut matched = query.copy_and_clear();

    for candidate in candidates {
        let match_mh = candidate.minhash.downsample_scaled(scaled)?;
        let isect = query.intersection_sketch(&match_mh)?;
        matched.merge(&isect)?;
    }

    let mut unmatched = query;
    unmatched.remove_from(&matched)?;

    Ok((matched, unmatched))
}

/// Compute prefetch candidates by scanning an iterator of signatures.
/// Shared by backends that load sketches one by one.
pub(crate) fn prefetch_from_sigs<I>(
    sigs: I,
    query: &KmerMinHash,
    threshold_bp: u64,
) -> Result<Vec<PrefetchResult>>
where
    I: Iterator<Item = (Signature, String)>,
{
    let mut heap = BinaryHeap::new();

    for (sig, location) in sigs {
        let match_mh = match sig.select_sketch(query) {
            Some(mh) => mh.clone(),
            None => match sig.minhash() {
                Some(mh) => mh.clone(),
                None => continue,
            },
        };

        let scaled = u64::max(query.scaled(), match_mh.scaled());
        if scaled == 0 {
            // num sketches have no bp-denominated overlap
            continue;
        }

        let overlap = query.count_common(&match_mh, true)?;
        let threshold_hashes = prefetch_threshold_hashes(threshold_bp, scaled);

        if overlap > 0 && overlap >= threshold_hashes {
            heap.push(PrefetchResult {
                name: sig.name(),
                md5: match_mh.md5sum(),
                location,
                minhash: match_mh.flatten(),
                signature: sig,
                overlap,
            });
        }
    }

    Ok(heap.into_sorted_vec().into_iter().rev().collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encodings::HashFunctions;

    fn mh_with(hashes: &[u64]) -> KmerMinHash {
        let mut mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        mh.add_many(hashes).unwrap();
        mh
    }

    fn candidate(name: &str, hashes: &[u64]) -> PrefetchResult {
        let mh = mh_with(hashes);
        let md5 = mh.md5sum();
        let mut sig = Signature::default();
        sig.set_name(name);
        sig.push(mh.clone());
        PrefetchResult {
            name: name.into(),
            md5,
            location: format!("{}.sig", name),
            minhash: mh,
            signature: sig,
            overlap: hashes.len() as u64,
        }
    }

    #[test]
    fn gather_three_way_decomposition() {
        // query = union of three disjoint references: 10 + 5 + 2 hashes
        let ref_a: Vec<u64> = (1..=10).collect();
        let ref_b: Vec<u64> = (101..=105).collect();
        let ref_c: Vec<u64> = (201..=202).collect();

        let mut all = ref_a.clone();
        all.extend(&ref_b);
        all.extend(&ref_c);
        let query = mh_with(&all);

        let mut counter = CounterGather::new();
        counter.add(candidate("b", &ref_b));
        counter.add(candidate("a", &ref_a));
        counter.add(candidate("c", &ref_c));

        let results = gather_with_counter(&query, &mut counter, 0).unwrap();
        assert_eq!(results.len(), 3);

        let names: Vec<_> = results.iter().map(|r| r.name().clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let fractions: Vec<_> = results.iter().map(|r| r.f_unique_to_query()).collect();
        assert_eq!(fractions, vec![10.0 / 17.0, 5.0 / 17.0, 2.0 / 17.0]);

        // non-increasing, total never exceeds 1
        assert!(fractions.windows(2).all(|w| w[0] >= w[1]));
        assert!(fractions.iter().sum::<f64>() <= 1.0 + f64::EPSILON);
    }

    #[test]
    fn gather_claims_each_hash_once() {
        // two references share hashes 5..=10; the larger one claims them
        let ref_a: Vec<u64> = (1..=10).collect();
        let ref_b: Vec<u64> = (5..=12).collect();
        let query = mh_with(&(1..=12).collect::<Vec<_>>());

        let mut counter = CounterGather::new();
        counter.add(candidate("a", &ref_a));
        counter.add(candidate("b", &ref_b));

        let results = gather_with_counter(&query, &mut counter, 0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name(), "a");

        let total_claimed: usize = results
            .iter()
            .map(|r| (r.f_unique_to_query() * 12.0).round() as usize)
            .sum();
        assert_eq!(total_claimed, 12);

        // second result only got the hashes a did not claim
        assert_eq!(results[1].f_unique_to_query(), 2.0 / 12.0);
    }

    #[test]
    fn gather_ties_break_by_md5() {
        let ref_a: Vec<u64> = (1..=5).collect();
        let ref_b: Vec<u64> = (11..=15).collect();
        let mut all = ref_a.clone();
        all.extend(&ref_b);
        let query = mh_with(&all);

        let ca = candidate("a", &ref_a);
        let cb = candidate("b", &ref_b);
        let winner_md5 = std::cmp::min(ca.md5.clone(), cb.md5.clone());

        let mut counter = CounterGather::new();
        counter.add(ca);
        counter.add(cb);

        let results = gather_with_counter(&query, &mut counter, 0).unwrap();
        assert_eq!(results[0].md5(), &winner_md5);
    }

    #[test]
    fn gather_respects_threshold() {
        let ref_a: Vec<u64> = (1..=10).collect();
        let ref_b: Vec<u64> = (101..=102).collect();
        let mut all = ref_a.clone();
        all.extend(&ref_b);

        // scaled=1, so threshold_bp equals a hash count
        let query = mh_with(&all);
        let mut counter = CounterGather::new();
        counter.add(candidate("a", &ref_a));
        counter.add(candidate("b", &ref_b));

        let results = gather_with_counter(&query, &mut counter, 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name(), "a");
    }

    #[test]
    fn gather_empty_query() {
        let query = mh_with(&[]);
        let mut counter = CounterGather::new();
        counter.add(candidate("a", &[1, 2, 3]));
        let results = gather_with_counter(&query, &mut counter, 0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn gather_weighted_stats() {
        let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, true, 0);
        query
            .set_abundances(&[(1, 4), (2, 2), (3, 2), (11, 1), (12, 1)], false)
            .unwrap();

        let mut counter = CounterGather::new();
        counter.add(candidate("a", &[1, 2, 3]));
        counter.add(candidate("b", &[11, 12]));

        let results = gather_with_counter(&query, &mut counter, 0).unwrap();
        assert_eq!(results.len(), 2);

        // match a claims abundances 4+2+2 = 8 of 10 total
        assert_eq!(results[0].name(), "a");
        assert_eq!(results[0].f_unique_weighted(), 0.8);
        assert!((results[0].average_abund() - 8.0 / 3.0).abs() < 1e-9);
        assert_eq!(results[0].median_abund(), 2.0);
        assert_eq!(results[0].sum_weighted_found(), 8);
        assert_eq!(results[0].total_weighted_hashes(), 10);

        assert_eq!(results[1].f_unique_weighted(), 0.2);
        assert_eq!(results[1].sum_weighted_found(), 10);
    }

    #[test]
    fn prefetch_unions_partition_query() {
        let query = mh_with(&(1..=10).collect::<Vec<_>>());
        let candidates = vec![
            candidate("a", &[1, 2, 3]),
            candidate("b", &[3, 4, 20]),
        ];

        let (matched, unmatched) = prefetch_hash_unions(&query, &candidates).unwrap();
        assert_eq!(matched.mins(), vec![1, 2, 3, 4]);
        assert_eq!(unmatched.mins(), vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn counter_gather_peek_consume_protocol() {
        let query = mh_with(&(1..=10).collect::<Vec<_>>());
        let mut counter = CounterGather::new();
        counter.add(candidate("a", &(1..=6).collect::<Vec<_>>()));
        counter.add(candidate("b", &(5..=10).collect::<Vec<_>>()));

        let remaining = query.clone();
        let (idx, isect) = counter.peek(&remaining, 0).unwrap().unwrap();
        assert_eq!(counter.candidate(idx).name, "a");
        assert_eq!(isect.size(), 6);

        counter.consume(&isect).unwrap();
        // b now only has 5..=10 minus 5,6 = 4 hashes left
        let mut remaining = remaining;
        remaining.remove_from(&isect).unwrap();
        let (idx2, isect2) = counter.peek(&remaining, 0).unwrap().unwrap();
        assert_eq!(counter.candidate(idx2).name, "b");
        assert_eq!(isect2.size(), 4);
    }
}
