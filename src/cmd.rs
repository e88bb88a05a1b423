//! Sketch-template construction from parameter sets.
//!
//! [`ComputeParameters`] collects the options used to sketch sequences;
//! [`build_template`] expands them into one empty sketch per requested
//! ksize and molecule type, and [`Signature::from_params`] wraps the
//! result in a fresh signature.

use getset::{CopyGetters, Getters, Setters};
use typed_builder::TypedBuilder;

use crate::encodings::HashFunctions;
use crate::signature::Signature;
use crate::sketch::minhash::KmerMinHash;

impl Signature {
    /// Build a new [`Signature`] from a set of [`ComputeParameters`].
    pub fn from_params(params: &ComputeParameters) -> Signature {
        let template = build_template(params);

        Signature::builder()
            .hash_function("0.murmur64")
            .name(params.merge.clone())
            .filename(None)
            .signatures(template)
            .build()
    }
}

/// Parameters that can be used to construct sketches.
///
/// ksizes and molecule types are combinational (each combination yields a
/// sketch); the remaining options apply to every generated sketch.
#[derive(TypedBuilder, CopyGetters, Getters, Setters)]
pub struct ComputeParameters {
    /// List of k-mer sizes to generate
    #[getset(get = "pub", set = "pub")]
    #[builder(default = vec![21, 31, 51])]
    ksizes: Vec<u32>,

    /// Build nucleotide sketches
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = true)]
    dna: bool,

    /// Build Dayhoff-encoded amino acid sketches
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = false)]
    dayhoff: bool,

    /// Build hydrophobic-polar-encoded amino acid sketches
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = false)]
    hp: bool,

    /// Build a protein sketch
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = false)]
    protein: bool,

    /// Keep 1 in `scaled` of the input k-mers (0 disables)
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = 0u64)]
    scaled: u64,

    /// Number of hashes to keep in each sketch (when scaled is 0)
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = 500u32)]
    num_hashes: u32,

    /// seed used by MurmurHash
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = crate::DEFAULT_SEED)]
    seed: u64,

    /// Consume protein sequences directly, without translation
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = false)]
    input_is_protein: bool,

    /// Name for a signature merging all inputs
    #[getset(get = "pub", set = "pub")]
    #[builder(default = None)]
    merge: Option<String>,

    /// Track k-mer abundances in the generated sketches
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = false)]
    track_abundance: bool,

    /// Signature license. Currently only CC0 is supported
    #[getset(get = "pub", set = "pub")]
    #[builder(default = "CC0".into())]
    license: String,
}

impl Default for ComputeParameters {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Expand a parameter set into one empty sketch per ksize × moltype.
pub fn build_template(params: &ComputeParameters) -> Vec<KmerMinHash> {
    let num = if params.scaled > 0 {
        0
    } else {
        params.num_hashes
    };

    params
        .ksizes
        .iter()
        .flat_map(|k| {
            let mut ksigs = vec![];

            if params.protein {
                ksigs.push(KmerMinHash::new(
                    params.scaled,
                    *k,
                    HashFunctions::Murmur64Protein,
                    params.seed,
                    params.track_abundance,
                    num,
                ));
            }

            if params.dayhoff {
                ksigs.push(KmerMinHash::new(
                    params.scaled,
                    *k,
                    HashFunctions::Murmur64Dayhoff,
                    params.seed,
                    params.track_abundance,
                    num,
                ));
            }

            if params.hp {
                ksigs.push(KmerMinHash::new(
                    params.scaled,
                    *k,
                    HashFunctions::Murmur64Hp,
                    params.seed,
                    params.track_abundance,
                    num,
                ));
            }

            if params.dna {
                ksigs.push(KmerMinHash::new(
                    params.scaled,
                    *k,
                    HashFunctions::Murmur64Dna,
                    params.seed,
                    params.track_abundance,
                    num,
                ));
            }

            ksigs
        })
        .collect()
}
