use log::info;

use crate::collection::CollectionSet;
use crate::encodings::Idx;
use crate::index::search::JaccardSearch;
use crate::index::{prefetch_from_sigs, Index, IndexSearchResult, PrefetchResult};
use crate::selection::{Select, Selection};
use crate::signature::{Signature, SigsTrait};
use crate::sketch::minhash::KmerMinHash;
use crate::storage::{SigStore, Storage};
use crate::Result;

/// A linear-scan index over any collection. Slow but fully general: it
/// works for num and scaled sketches alike, straight from storage.
pub struct LinearIndex {
    collection: CollectionSet,
}

impl LinearIndex {
    pub fn from_collection(collection: CollectionSet) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &CollectionSet {
        &self.collection
    }

    pub fn sig_for_dataset(&self, dataset_id: Idx) -> Result<SigStore> {
        self.collection.sig_for_dataset(dataset_id)
    }

    /// Insert a signature into the backing collection.
    pub fn insert(&mut self, sig: Signature) -> Result<()> {
        self.collection.insert(sig)
    }

    fn each_signature(&self) -> impl Iterator<Item = (Signature, String)> + '_ {
        self.collection.iter().filter_map(move |(dataset_id, record)| {
            let location = record.internal_location().to_string();
            match self.collection.sig_for_dataset(dataset_id) {
                Ok(sig) => Some((sig.into(), location)),
                Err(_) => {
                    info!("skipping unloadable signature at {}", location);
                    None
                }
            }
        })
    }
}

impl Index for LinearIndex {
    fn len(&self) -> usize {
        self.collection.len()
    }

    fn location(&self) -> Option<String> {
        Some(self.collection.storage().spec())
    }

    fn signatures(&self) -> Result<Vec<Signature>> {
        Ok(self.each_signature().map(|(sig, _)| sig).collect())
    }

    fn signatures_with_location(&self) -> Result<Vec<(Signature, String)>> {
        Ok(self.each_signature().collect())
    }

    fn find(
        &self,
        search_fn: &mut JaccardSearch,
        query: &KmerMinHash,
    ) -> Result<Vec<IndexSearchResult>> {
        search_fn.check_is_compatible(query)?;

        if query.is_empty() {
            return Ok(vec![]);
        }

        let mut results = vec![];

        for (sig, location) in self.each_signature() {
            let subj_mh = match sig.select_sketch(query).or_else(|| sig.minhash()) {
                Some(mh) => mh,
                None => continue,
            };

            // bring both sketches to a common resolution before scoring
            let (query_mh, subj_mh) = if query.max_hash() != subj_mh.max_hash()
                && query.max_hash() != 0
                && subj_mh.max_hash() != 0
            {
                let scaled = u64::max(query.scaled(), subj_mh.scaled());
                (
                    query.downsample_scaled(scaled)?,
                    subj_mh.downsample_scaled(scaled)?,
                )
            } else {
                (query.clone(), subj_mh.clone())
            };

            let (shared, total) = query_mh.intersection_size(&subj_mh)?;
            let score = search_fn.score(
                query_mh.size(),
                shared as usize,
                subj_mh.size(),
                total as usize,
            );

            if search_fn.passes(score) {
                search_fn.collect(score);
                results.push(IndexSearchResult {
                    score,
                    signature: sig,
                    location,
                });
            }
        }

        Ok(results)
    }

    fn prefetch(&self, query: &KmerMinHash, threshold_bp: u64) -> Result<Vec<PrefetchResult>> {
        if query.is_empty() {
            return Ok(vec![]);
        }
        prefetch_from_sigs(self.each_signature(), query, threshold_bp)
    }
}

impl Select for LinearIndex {
    fn select(self, selection: &Selection) -> Result<Self> {
        let collection = self.collection.into_inner().select(selection)?;
        Ok(Self {
            collection: collection.try_into()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collection::Collection;
    use crate::encodings::HashFunctions;
    use crate::index::search::SearchType;

    fn sig_from_hashes(name: &str, hashes: &[u64]) -> Signature {
        let mut mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        mh.add_many(hashes).unwrap();
        let mut sig = Signature::default();
        sig.set_name(name);
        sig.push(mh);
        sig
    }

    fn test_index() -> LinearIndex {
        let sigs = vec![
            sig_from_hashes("exact", &[1, 2, 3, 4, 5]),
            sig_from_hashes("partial", &[1, 2, 3, 40, 50]),
            sig_from_hashes("disjoint", &[100, 200, 300]),
        ];
        let collection = Collection::from_sigs(sigs).unwrap();
        LinearIndex::from_collection(collection.try_into().unwrap())
    }

    #[test]
    fn search_threshold() {
        let index = test_index();
        let mut query_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query_mh.add_many(&[1, 2, 3, 4, 5]).unwrap();

        let mut search_fn = JaccardSearch::new(SearchType::Jaccard, 1.0);
        let results = index.search(&mut search_fn, &query_mh).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].signature.name(), "exact");
        assert_eq!(results[0].score, 1.0);

        let mut search_fn = JaccardSearch::new(SearchType::Jaccard, 0.1);
        let results = index.search(&mut search_fn, &query_mh).unwrap();
        assert_eq!(results.len(), 2);
        // descending score
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn search_containment() {
        let index = test_index();
        let mut query_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query_mh.add_many(&[1, 2, 3]).unwrap();

        let mut search_fn = JaccardSearch::new(SearchType::Containment, 0.9);
        let results = index.search(&mut search_fn, &query_mh).unwrap();
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.score, 1.0);
        }
    }

    #[test]
    fn search_best_only() {
        let index = test_index();
        let mut query_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query_mh.add_many(&[1, 2, 3, 4, 5]).unwrap();

        let mut search_fn = JaccardSearch::new(SearchType::Jaccard, 0.1).with_best_only();
        let results = index.search(&mut search_fn, &query_mh).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].signature.name(), "exact");
    }

    #[test]
    fn empty_query_empty_results() {
        let index = test_index();
        let query_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);

        let mut search_fn = JaccardSearch::new(SearchType::Jaccard, 0.0);
        assert!(index.search(&mut search_fn, &query_mh).unwrap().is_empty());
        assert!(index.prefetch(&query_mh, 0).unwrap().is_empty());
        assert!(index.gather(&query_mh, 0).unwrap().is_empty());
    }

    #[test]
    fn prefetch_does_not_consume() {
        let index = test_index();
        let mut query_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query_mh.add_many(&[1, 2, 3, 4, 5, 40, 50]).unwrap();

        let results = index.prefetch(&query_mh, 0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].overlap, 5);
        assert_eq!(results[1].overlap, 5);
        // the query is untouched
        assert_eq!(query_mh.size(), 7);
    }

    #[test]
    fn gather_via_index() {
        let index = test_index();
        let mut query_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query_mh.add_many(&[1, 2, 3, 4, 5, 40, 100, 200]).unwrap();

        let results = index.gather(&query_mh, 0).unwrap();
        assert_eq!(results.len(), 3);
        // "exact" claims 1..=5; "disjoint" claims 100, 200; "partial" is
        // left with just 40
        assert_eq!(results[0].name(), "exact");
        assert_eq!(results[1].name(), "disjoint");
        assert_eq!(results[2].name(), "partial");
        assert_eq!(results[0].f_unique_to_query(), 5.0 / 8.0);
        assert_eq!(results[1].f_unique_to_query(), 2.0 / 8.0);
        assert_eq!(results[2].f_unique_to_query(), 1.0 / 8.0);
    }

    #[test]
    fn select_narrows_index() {
        let index = test_index();
        let mut selection = Selection::default();
        selection.set_ksize(31);
        let narrowed = index.select(&selection).unwrap();
        assert_eq!(narrowed.len(), 3);

        let index = test_index();
        let mut selection = Selection::default();
        selection.set_ksize(21);
        let narrowed = index.select(&selection).unwrap();
        assert_eq!(narrowed.len(), 0);
    }
}
