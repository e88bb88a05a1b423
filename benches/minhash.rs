#[macro_use]
extern crate criterion;

use criterion::Criterion;

use fracmash::encodings::HashFunctions;
use fracmash::signature::SigsTrait;
use fracmash::sketch::minhash::KmerMinHash;

fn synthetic_sequence(len: usize) -> Vec<u8> {
    // deterministic pseudo-random DNA
    let mut state = 0x2545F4914F6CDD1Du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            b"ACGT"[(state % 4) as usize]
        })
        .collect()
}

fn add_sequence(c: &mut Criterion) {
    let seq = synthetic_sequence(10_000);

    let mut group = c.benchmark_group("minhash");
    group.sample_size(10);

    group.bench_function("add_sequence scaled=1000", |b| {
        b.iter(|| {
            let mut mh = KmerMinHash::new(1000, 21, HashFunctions::Murmur64Dna, 42, false, 0);
            mh.add_sequence(&seq, false).unwrap();
        });
    });

    group.bench_function("add_sequence num=500", |b| {
        b.iter(|| {
            let mut mh = KmerMinHash::new(0, 21, HashFunctions::Murmur64Dna, 42, false, 500);
            mh.add_sequence(&seq, false).unwrap();
        });
    });

    group.bench_function("add_sequence translated", |b| {
        b.iter(|| {
            let mut mh = KmerMinHash::new(0, 21, HashFunctions::Murmur64Protein, 42, false, 500);
            mh.add_sequence(&seq, false).unwrap();
        });
    });
}

fn comparisons(c: &mut Criterion) {
    let mut mh1 = KmerMinHash::new(1, 21, HashFunctions::Murmur64Dna, 42, false, 0);
    let mut mh2 = KmerMinHash::new(1, 21, HashFunctions::Murmur64Dna, 42, false, 0);

    for i in 0..10_000u64 {
        let h = i.wrapping_mul(11400714819323198485);
        mh1.add_hash(h);
        if i % 2 == 0 {
            mh2.add_hash(h);
        }
    }

    let mut group = c.benchmark_group("minhash");
    group.sample_size(10);

    group.bench_function("intersection_size", |b| {
        b.iter(|| {
            mh1.intersection_size(&mh2).unwrap();
        });
    });

    group.bench_function("jaccard", |b| {
        b.iter(|| {
            mh1.jaccard(&mh2).unwrap();
        });
    });

    group.bench_function("md5sum", |b| {
        b.iter(|| {
            // recomputes from scratch, bypassing the cache
            mh1.check_md5sum().unwrap();
        });
    });
}

criterion_group!(benches, add_sequence, comparisons);
criterion_main!(benches);
