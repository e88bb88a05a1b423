//! # Compute, compare and search sketches of nucleotide and protein sequences.
//!
//! fracmash computes [MinHash][0] and FracMinHash sketches from DNA and
//! amino acid sequences, compares them to each other, and searches indexed
//! collections of sketches on disk.
//!
//! [0]: https://en.wikipedia.org/wiki/MinHash
//!
//! The main types are [`sketch::minhash::KmerMinHash`] (the sketch and its
//! algebra), [`signature::Signature`] (a named bundle of sketches with a
//! stable wire format), [`collection::Collection`] (a manifest plus a
//! storage backend) and the [`index`] module (linear and SQLite-backed
//! search, prefetch and gather).

pub mod errors;
pub use errors::FracmashError as Error;

pub mod ani_utils;
pub mod cmd;
pub mod collection;
pub mod encodings;
pub mod index;
pub mod manifest;
pub mod picklist;
pub mod prelude;
pub mod selection;
pub mod signature;
pub mod sketch;
pub mod storage;
pub mod tax;

use murmurhash3::murmurhash3_x64_128;

pub type Result<T> = std::result::Result<T, Error>;

type HashIntoType = u64;

/// Default seed for the MurmurHash hash function.
pub const DEFAULT_SEED: u64 = 42;

pub fn _hash_murmur(kmer: &[u8], seed: u64) -> u64 {
    murmurhash3_x64_128(kmer, seed).0
}
