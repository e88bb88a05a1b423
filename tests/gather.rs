use fracmash::collection::Collection;
use fracmash::encodings::HashFunctions;
use fracmash::index::{CounterGather, Index, LinearIndex};
use fracmash::signature::{Signature, SigsTrait};
use fracmash::sketch::minhash::KmerMinHash;

fn mh_from(hashes: &[u64], track_abundance: bool) -> KmerMinHash {
    let mut mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, track_abundance, 0);
    mh.add_many(hashes).unwrap();
    mh
}

fn sig_from(name: &str, hashes: &[u64]) -> Signature {
    let mut sig = Signature::default();
    sig.set_name(name);
    sig.push(mh_from(hashes, false));
    sig
}

#[test]
fn gather_covers_query_exactly_once() {
    // three references with overlaps of 10, 5 and 2 hashes against the
    // query, pairwise disjoint
    let ref_a: Vec<u64> = (1..=10).collect();
    let ref_b: Vec<u64> = (101..=105).collect();
    let ref_c: Vec<u64> = (201..=202).collect();

    let mut all = ref_a.clone();
    all.extend(&ref_b);
    all.extend(&ref_c);

    let collection = Collection::from_sigs(vec![
        sig_from("a", &ref_a),
        sig_from("b", &ref_b),
        sig_from("c", &ref_c),
    ])
    .unwrap();
    let index = LinearIndex::from_collection(collection.try_into().unwrap());

    let query = mh_from(&all, false);
    let results = index.gather(&query, 0).unwrap();

    assert_eq!(results.len(), 3);
    let fractions: Vec<f64> = results.iter().map(|r| r.f_unique_to_query()).collect();
    assert_eq!(fractions, vec![10.0 / 17.0, 5.0 / 17.0, 2.0 / 17.0]);

    // ranks are assigned in emission order
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.gather_result_rank(), i);
    }

    // remaining_bp decreases to zero
    assert_eq!(results[2].remaining_bp(), 0);
}

#[test]
fn prefetch_then_gather_agree() {
    let ref_a: Vec<u64> = (1..=20).collect();
    let ref_b: Vec<u64> = (15..=30).collect();

    let collection =
        Collection::from_sigs(vec![sig_from("a", &ref_a), sig_from("b", &ref_b)]).unwrap();
    let index = LinearIndex::from_collection(collection.try_into().unwrap());

    let query = mh_from(&(1..=30).collect::<Vec<_>>(), false);

    let prefetched = index.prefetch(&query, 0).unwrap();
    assert_eq!(prefetched.len(), 2);
    assert_eq!(prefetched[0].overlap, 20);
    assert_eq!(prefetched[1].overlap, 16);

    let gathered = index.gather(&query, 0).unwrap();
    assert_eq!(gathered.len(), 2);
    assert_eq!(gathered[0].name(), "a");
    // b only claims what a left behind
    assert_eq!(gathered[1].f_unique_to_query(), 10.0 / 30.0);
}

#[test]
fn gather_threshold_stops_early() {
    let ref_a: Vec<u64> = (1..=10).collect();
    let ref_b: Vec<u64> = (101..=103).collect();
    let mut all = ref_a.clone();
    all.extend(&ref_b);

    let collection =
        Collection::from_sigs(vec![sig_from("a", &ref_a), sig_from("b", &ref_b)]).unwrap();
    let index = LinearIndex::from_collection(collection.try_into().unwrap());

    let query = mh_from(&all, false);

    // at scaled=1, threshold_bp is a hash count
    let results = index.gather(&query, 5).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name(), "a");
}

#[test]
fn gather_with_abundance_weighting() {
    let ref_a: Vec<u64> = (1..=4).collect();
    let ref_b: Vec<u64> = (11..=12).collect();

    let collection =
        Collection::from_sigs(vec![sig_from("a", &ref_a), sig_from("b", &ref_b)]).unwrap();
    let index = LinearIndex::from_collection(collection.try_into().unwrap());

    let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, true, 0);
    query
        .set_abundances(&[(1, 10), (2, 10), (3, 10), (4, 10), (11, 5), (12, 5)], false)
        .unwrap();

    let results = index.gather(&query, 0).unwrap();
    assert_eq!(results.len(), 2);

    assert_eq!(results[0].name(), "a");
    assert_eq!(results[0].f_unique_weighted(), 40.0 / 50.0);
    assert_eq!(results[0].average_abund(), 10.0);
    assert_eq!(results[1].f_unique_weighted(), 10.0 / 50.0);
    assert_eq!(results[1].median_abund(), 5.0);

    // unweighted fractions still follow hash counts
    assert_eq!(results[0].f_unique_to_query(), 4.0 / 6.0);
}

#[test]
fn counter_gather_protocol_direct() {
    let ref_a: Vec<u64> = (1..=10).collect();
    let ref_b: Vec<u64> = (6..=15).collect();

    let collection =
        Collection::from_sigs(vec![sig_from("a", &ref_a), sig_from("b", &ref_b)]).unwrap();
    let index = LinearIndex::from_collection(collection.try_into().unwrap());

    let query = mh_from(&(1..=15).collect::<Vec<_>>(), false);
    let counter: CounterGather = index.counter_gather(&query, 0).unwrap();
    assert_eq!(counter.len(), 2);

    let (best, isect) = counter.peek(&query, 0).unwrap().unwrap();
    assert_eq!(counter.candidate(best).overlap, 10);
    assert_eq!(isect.size(), 10);
}

#[test]
fn gather_query_ani_is_derivable() {
    let ref_a: Vec<u64> = (1..=50).collect();
    let collection = Collection::from_sigs(vec![sig_from("a", &ref_a)]).unwrap();
    let index = LinearIndex::from_collection(collection.try_into().unwrap());

    let query = mh_from(&(1..=100).collect::<Vec<_>>(), false);
    let results = index.gather(&query, 0).unwrap();
    assert_eq!(results.len(), 1);

    let expected = (0.5f64).powf(1.0 / 31.0);
    assert!((results[0].query_containment_ani() - expected).abs() < 1e-12);
}
