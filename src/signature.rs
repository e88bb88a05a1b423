//! # Compressed representations of genomic data
//!
//! A signature is a named collection of sketches for a genomic dataset,
//! with a canonical JSON wire format.

use core::iter::FusedIterator;

use std::fs::File;
use std::io;
use std::path::Path;
use std::str;

use cfg_if::cfg_if;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::encodings::{aa_to_dayhoff, aa_to_hp, revcomp, to_aa, HashFunctions, VALID};
use crate::prelude::*;
use crate::selection::Selection;
use crate::sketch::minhash::KmerMinHash;
use crate::Error;
use crate::HashIntoType;

/// Behavior shared by anything that can accumulate sequence hashes.
pub trait SigsTrait {
    fn size(&self) -> usize;
    fn to_vec(&self) -> Vec<u64>;
    fn ksize(&self) -> usize;
    fn check_compatible(&self, other: &Self) -> Result<(), Error>;
    fn seed(&self) -> u64;

    fn hash_function(&self) -> HashFunctions;

    fn add_hash(&mut self, hash: HashIntoType);

    fn add_sequence(&mut self, seq: &[u8], force: bool) -> Result<(), Error> {
        let ready_hashes = SeqToHashes::new(
            seq,
            self.ksize(),
            force,
            false,
            self.hash_function(),
            self.seed(),
        );

        for hash_value in ready_hashes {
            match hash_value {
                Ok(0) => continue,
                Ok(x) => self.add_hash(x),
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn add_protein(&mut self, seq: &[u8]) -> Result<(), Error> {
        let ready_hashes = SeqToHashes::new(
            seq,
            self.ksize(),
            false,
            true,
            self.hash_function(),
            self.seed(),
        );

        for hash_value in ready_hashes {
            match hash_value {
                Ok(0) => continue,
                Ok(x) => self.add_hash(x),
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

/// Lazy iterator turning a sequence into k-mer hashes, in emission order.
///
/// For DNA input with a DNA hash function this yields one hash per k-mer
/// window, canonicalized against the reverse complement. For protein-family
/// hash functions on DNA input all six reading frames are emitted (the
/// three forward frames, then the three reverse-complement frames, window
/// by window). For protein input (`is_protein`), windows of the (possibly
/// recoded) residue sequence are hashed directly.
///
/// Invalid k-mers raise [`Error::InvalidDNA`] unless `force` is set; under
/// `force` they are skipped, or emitted as the zero sentinel when
/// `bad_kmers_as_zeroes` is also set.
pub struct SeqToHashes {
    sequence: Vec<u8>,
    kmer_index: usize,
    k_size: usize,
    max_index: usize,
    force: bool,
    bad_kmers_as_zeroes: bool,
    is_protein: bool,
    hash_function: HashFunctions,
    seed: u64,

    dna_configured: bool,
    dna_rc: Vec<u8>,
    dna_last_position_check: usize,

    prot_configured: bool,
    aa_seq: Vec<u8>,

    translated: bool,
    hashes_buffer: Vec<u64>,
    buffer_index: usize,
}

impl SeqToHashes {
    pub fn new(
        seq: &[u8],
        k_size: usize,
        force: bool,
        is_protein: bool,
        hash_function: HashFunctions,
        seed: u64,
    ) -> SeqToHashes {
        let mut ksize = k_size;

        // protein-family hashes use residue-denominated k
        if is_protein || !hash_function.dna() {
            ksize = k_size / 3;
        }

        // a max_index of zero ends the iterator immediately
        let max_index = if seq.len() >= ksize {
            seq.len() - ksize + 1
        } else {
            0
        };

        SeqToHashes {
            sequence: seq.to_ascii_uppercase(),
            k_size: ksize,
            kmer_index: 0,
            max_index,
            force,
            bad_kmers_as_zeroes: false,
            is_protein,
            hash_function,
            seed,
            dna_configured: false,
            dna_rc: vec![],
            dna_last_position_check: 0,
            prot_configured: false,
            aa_seq: vec![],
            translated: false,
            hashes_buffer: vec![],
            buffer_index: 0,
        }
    }

    /// Emit the zero sentinel for invalid k-mers instead of skipping them.
    /// Implies `force`.
    pub fn with_bad_kmers_as_zeroes(mut self) -> Self {
        self.force = true;
        self.bad_kmers_as_zeroes = true;
        self
    }

    fn next_dna(&mut self) -> Option<Result<u64, Error>> {
        let ksize = self.k_size;
        let len = self.sequence.len();

        while self.kmer_index < self.max_index {
            let i = self.kmer_index;
            let kmer = &self.sequence[i..i + ksize];

            let mut valid = true;
            for j in usize::max(i, self.dna_last_position_check)..i + ksize {
                if !VALID[self.sequence[j] as usize] {
                    valid = false;
                    break;
                }
                self.dna_last_position_check += 1;
            }

            if !valid {
                if !self.force {
                    return Some(Err(Error::InvalidDNA {
                        message: String::from_utf8_lossy(kmer).into(),
                    }));
                }
                self.kmer_index += 1;
                if self.bad_kmers_as_zeroes {
                    return Some(Ok(0));
                }
                continue;
            }

            // While the k-mer window moves forward on the sequence, a
            // matching window moves backwards on the reverse complement;
            // the canonical k-mer is the lexicographic minimum of the two.
            let krc = &self.dna_rc[len - ksize - i..len - i];
            let hash = crate::_hash_murmur(std::cmp::min(kmer, krc), self.seed);
            self.kmer_index += 1;
            return Some(Ok(hash));
        }

        None
    }

    fn fill_translated_buffer(&mut self) {
        // all six frames at once; the iterator then drains the buffer
        for frame_number in 0..3 {
            for source in [&self.sequence, &self.dna_rc] {
                let substr: Vec<u8> = source.iter().copied().skip(frame_number).collect();
                let aa = to_aa(
                    &substr,
                    self.hash_function.dayhoff(),
                    self.hash_function.hp(),
                )
                .expect("translation cannot fail on uppercase input");

                for n in aa.windows(self.k_size) {
                    self.hashes_buffer.push(crate::_hash_murmur(n, self.seed));
                }
            }
        }
    }
}

impl Iterator for SeqToHashes {
    type Item = Result<u64, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.is_protein {
            if !self.dna_configured {
                if self.sequence.len() < self.k_size
                    || (!self.hash_function.dna() && self.sequence.len() < self.k_size * 3)
                {
                    return None;
                }
                self.dna_rc = revcomp(&self.sequence);
                self.dna_configured = true;
            }

            if self.hash_function.dna() {
                self.next_dna()
            } else {
                // translated protein: fill once, then drain
                if !self.translated {
                    self.fill_translated_buffer();
                    self.translated = true;
                }
                if self.buffer_index < self.hashes_buffer.len() {
                    let hash = self.hashes_buffer[self.buffer_index];
                    self.buffer_index += 1;
                    Some(Ok(hash))
                } else {
                    None
                }
            }
        } else {
            // protein input; k is already residue-denominated
            if self.kmer_index >= self.max_index {
                return None;
            }

            if !self.prot_configured {
                self.aa_seq = match self.hash_function {
                    HashFunctions::Murmur64Protein => self.sequence.clone(),
                    HashFunctions::Murmur64Dayhoff => {
                        self.sequence.iter().copied().map(aa_to_dayhoff).collect()
                    }
                    HashFunctions::Murmur64Hp => {
                        self.sequence.iter().copied().map(aa_to_hp).collect()
                    }
                    invalid => {
                        return Some(Err(Error::InvalidHashFunction {
                            function: format!("{}", invalid),
                        }));
                    }
                };
                self.prot_configured = true;
            }

            let aa_kmer = &self.aa_seq[self.kmer_index..self.kmer_index + self.k_size];
            let hash = crate::_hash_murmur(aa_kmer, self.seed);
            self.kmer_index += 1;
            Some(Ok(hash))
        }
    }
}

/// Paired `(canonical_kmer, hash)` output, mostly useful for explaining
/// which k-mers produced which hashes.
pub fn kmers_and_hashes(
    seq: &[u8],
    k_size: usize,
    force: bool,
    is_protein: bool,
    hash_function: HashFunctions,
    seed: u64,
) -> Result<Vec<(String, u64)>, Error> {
    let sequence = seq.to_ascii_uppercase();
    let mut pairs = vec![];

    if hash_function.dna() && !is_protein {
        if sequence.len() < k_size {
            return Ok(pairs);
        }
        let rc = revcomp(&sequence);
        let len = sequence.len();
        for i in 0..=len - k_size {
            let kmer = &sequence[i..i + k_size];
            if kmer.iter().any(|c| !VALID[*c as usize]) {
                if !force {
                    return Err(Error::InvalidDNA {
                        message: String::from_utf8_lossy(kmer).into(),
                    });
                }
                continue;
            }
            let krc = &rc[len - k_size - i..len - i];
            let canonical = std::cmp::min(kmer, krc);
            pairs.push((
                String::from_utf8_lossy(canonical).into(),
                crate::_hash_murmur(canonical, seed),
            ));
        }
        return Ok(pairs);
    }

    let ksize = k_size / 3;
    let frames: Vec<Vec<u8>> = if is_protein {
        let recoded: Vec<u8> = match hash_function {
            HashFunctions::Murmur64Protein => sequence.clone(),
            HashFunctions::Murmur64Dayhoff => sequence.iter().copied().map(aa_to_dayhoff).collect(),
            HashFunctions::Murmur64Hp => sequence.iter().copied().map(aa_to_hp).collect(),
            invalid => {
                return Err(Error::InvalidHashFunction {
                    function: format!("{}", invalid),
                })
            }
        };
        vec![recoded]
    } else {
        let rc = revcomp(&sequence);
        let mut frames = vec![];
        for frame_number in 0..3 {
            for source in [&sequence, &rc] {
                let substr: Vec<u8> = source.iter().copied().skip(frame_number).collect();
                frames.push(to_aa(
                    &substr,
                    hash_function.dayhoff(),
                    hash_function.hp(),
                )?);
            }
        }
        frames
    };

    for frame in frames {
        for aa_kmer in frame.windows(ksize) {
            pairs.push((
                String::from_utf8_lossy(aa_kmer).into(),
                crate::_hash_murmur(aa_kmer, seed),
            ));
        }
    }

    Ok(pairs)
}

#[derive(Serialize, Deserialize, Debug, Clone, TypedBuilder)]
pub struct Signature {
    #[serde(default = "default_class")]
    #[builder(default = default_class())]
    class: String,

    #[serde(default)]
    #[builder(default)]
    email: String,

    #[builder(setter(into))]
    hash_function: String,

    #[builder(default)]
    filename: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,

    #[serde(default = "default_license")]
    #[builder(default = default_license())]
    license: String,

    pub(crate) signatures: Vec<KmerMinHash>,

    #[serde(default = "default_version")]
    #[builder(default = default_version())]
    version: f64,
}

fn default_license() -> String {
    "CC0".to_string()
}

fn default_class() -> String {
    "sourmash_signature".to_string()
}

fn default_version() -> f64 {
    0.4
}

impl Signature {
    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(filename) = &self.filename {
            filename.clone()
        } else {
            self.md5sum()
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.into())
    }

    pub fn filename(&self) -> String {
        if let Some(filename) = &self.filename {
            filename.clone()
        } else {
            "".into()
        }
    }

    pub fn set_filename(&mut self, name: &str) {
        self.filename = Some(name.into())
    }

    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    pub fn sketches(&self) -> Vec<KmerMinHash> {
        self.signatures.clone()
    }

    pub fn reset_sketches(&mut self) {
        self.signatures = vec![];
    }

    pub fn push(&mut self, sketch: KmerMinHash) {
        self.signatures.push(sketch);
    }

    pub fn license(&self) -> String {
        self.license.clone()
    }

    pub fn class(&self) -> String {
        self.class.clone()
    }

    pub fn hash_function(&self) -> String {
        self.hash_function.clone()
    }

    pub fn email(&self) -> String {
        self.email.clone()
    }

    /// Content fingerprint. Only defined when this signature carries a
    /// single sketch; narrow with `select` first otherwise.
    pub fn md5sum(&self) -> String {
        if self.signatures.len() == 1 {
            self.signatures[0].md5sum()
        } else {
            panic!("md5sum is only defined for single-sketch signatures; run select first")
        }
    }

    /// The single sketch, when there is exactly one.
    pub fn minhash(&self) -> Option<&KmerMinHash> {
        if self.signatures.len() == 1 {
            self.signatures.first()
        } else {
            None
        }
    }

    /// The first sketch compatible with `template`.
    pub fn select_sketch(&self, template: &KmerMinHash) -> Option<&KmerMinHash> {
        self.signatures
            .iter()
            .find(|mh| mh.check_compatible(template).is_ok())
    }

    /// Apply `f` to the sketches of this (otherwise frozen) signature,
    /// returning the re-frozen result. The mutable view cannot escape the
    /// closure.
    pub fn update<F>(mut self, f: F) -> Result<Signature, Error>
    where
        F: FnOnce(&mut Vec<KmerMinHash>) -> Result<(), Error>,
    {
        f(&mut self.signatures)?;
        Ok(self)
    }

    /// Verify the stored fingerprint of every sketch against a fresh
    /// computation.
    pub fn check_md5sum(&self) -> Result<(), Error> {
        for mh in &self.signatures {
            mh.check_md5sum()?;
        }
        Ok(())
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<Signature>, Error> {
        let path_str = path.as_ref().display().to_string();
        let mut reader = io::BufReader::new(
            File::open(path).map_err(|e| Error::from(e).while_loading(&path_str))?,
        );
        Signature::from_reader(&mut reader).map_err(|e| e.while_loading(&path_str))
    }

    pub fn from_reader<R>(rdr: R) -> Result<Vec<Signature>, Error>
    where
        R: io::Read,
    {
        let (rdr, _format) = niffler::get_reader(Box::new(rdr))?;

        let sigs: Vec<Signature> = serde_json::from_reader(rdr)?;
        Ok(sigs)
    }

    /// Load signatures, flattening multi-sketch files into one signature
    /// per sketch, filtering by `selection`, and verifying stored
    /// fingerprints unless `ignore_md5sum`.
    pub fn load_signatures<R>(
        buf: R,
        selection: Option<&Selection>,
        ignore_md5sum: bool,
    ) -> Result<Vec<Signature>, Error>
    where
        R: io::Read,
    {
        let orig_sigs = Signature::from_reader(buf)?;

        let flat_sigs = orig_sigs.into_iter().flat_map(|s| {
            s.signatures
                .iter()
                .map(|mh| {
                    let mut new_s = s.clone();
                    new_s.signatures = vec![mh.clone()];
                    new_s
                })
                .collect::<Vec<Signature>>()
        });

        let mut result = vec![];
        for sig in flat_sigs {
            if !ignore_md5sum {
                sig.check_md5sum()?;
            }
            let sig = match selection {
                Some(selection) => sig.select(selection)?,
                None => sig,
            };
            if !sig.signatures.is_empty() {
                result.push(sig);
            }
        }

        Ok(result)
    }

    /// Serialize many signatures into one stream.
    pub fn save_signatures<W>(sigs: &[Signature], mut writer: W) -> Result<(), Error>
    where
        W: io::Write,
    {
        serde_json::to_writer(&mut writer, sigs)?;
        Ok(())
    }

    /// Write to `path`, gzip-compressed when the name ends in `.gz`. The
    /// output appears atomically: data goes to a temporary file first and
    /// is renamed into place on success.
    pub fn save_to_path<P: AsRef<Path>>(sigs: &[Signature], path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(parent)?;

        {
            let file = temp.as_file().try_clone()?;
            let mut writer: Box<dyn io::Write> = if path.extension().map_or(false, |e| e == "gz") {
                niffler::get_writer(
                    Box::new(file),
                    niffler::compression::Format::Gzip,
                    niffler::compression::Level::Six,
                )?
            } else {
                Box::new(file)
            };
            Signature::save_signatures(sigs, &mut writer)?;
        }

        temp.persist(path)
            .map_err(|e| Error::from(io::Error::from(e.error)))?;
        Ok(())
    }

    pub fn add_sequence(&mut self, seq: &[u8], force: bool) -> Result<(), Error> {
        cfg_if! {
        if #[cfg(feature = "parallel")] {
            self.signatures
                .par_iter_mut()
                .try_for_each(|sketch| {
                    sketch.add_sequence(seq, force) }
                )?;
        } else {
            for sketch in self.signatures.iter_mut(){
                sketch.add_sequence(seq, force)?;
            }
        }
        }

        Ok(())
    }

    pub fn add_protein(&mut self, seq: &[u8]) -> Result<(), Error> {
        cfg_if! {
        if #[cfg(feature = "parallel")] {
            self.signatures
                .par_iter_mut()
                .try_for_each(|sketch| {
                    sketch.add_protein(seq) }
                )?;
        } else {
            self.signatures
                .iter_mut()
                .try_for_each(|sketch| {
                    sketch.add_protein(seq) }
                )?;
        }
        }

        Ok(())
    }

    pub fn iter(&self) -> Iter<'_> {
        let length = self.signatures.len();
        Iter {
            iter: self.signatures.iter(),
            length,
        }
    }
}

pub struct Iter<'a> {
    iter: std::slice::Iter<'a, KmerMinHash>,
    length: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a KmerMinHash;

    fn next(&mut self) -> Option<&'a KmerMinHash> {
        if self.length == 0 {
            None
        } else {
            self.length -= 1;
            self.iter.next()
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.length, Some(self.length))
    }
}

impl FusedIterator for Iter<'_> {}

impl ExactSizeIterator for Iter<'_> {
    fn len(&self) -> usize {
        self.length
    }
}

impl ToWriter for Signature {
    fn to_writer<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: io::Write,
    {
        serde_json::to_writer(writer, &vec![&self])?;
        Ok(())
    }
}

impl Select for Signature {
    fn select(mut self, selection: &Selection) -> Result<Self, Error> {
        self.signatures.retain(|mh| {
            let mut valid = true;
            if let Some(ksize) = selection.ksize() {
                // protein-family ksizes are residue-denominated from the
                // caller's point of view
                let adjusted_ksize = if mh.hash_function().dna() {
                    ksize
                } else {
                    ksize * 3
                };
                valid = valid && mh.ksize() as u32 == adjusted_ksize;
            }
            if let Some(moltype) = selection.moltype() {
                valid = valid && mh.hash_function() == moltype;
            }
            if let Some(abund) = selection.abund() {
                valid = valid && mh.track_abundance() == abund;
            }
            if let Some(num) = selection.num() {
                valid = valid && mh.num() == num;
            }
            if let Some(sel_scaled) = selection.scaled() {
                valid = valid && mh.scaled() > 0 && mh.scaled() <= sel_scaled as u64;
            }
            if selection.containment().unwrap_or(false) {
                valid = valid && mh.scaled() > 0;
            }
            valid
        });

        // downsample the retained sketches if needed
        if let Some(sel_scaled) = selection.scaled() {
            for mh in self.signatures.iter_mut() {
                if mh.scaled() < sel_scaled as u64 {
                    *mh = mh.downsample_scaled(sel_scaled as u64)?;
                }
            }
        }
        Ok(self)
    }
}

impl Default for Signature {
    fn default() -> Signature {
        Signature {
            class: default_class(),
            email: "".to_string(),
            hash_function: "0.murmur64".to_string(),
            license: default_license(),
            filename: None,
            name: None,
            signatures: Vec::new(),
            version: default_version(),
        }
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Signature) -> bool {
        let metadata = self.class == other.class
            && self.email == other.email
            && self.hash_function == other.hash_function
            && self.filename == other.filename
            && self.name == other.name;

        if let (Some(mh), Some(other_mh)) = (self.signatures.first(), other.signatures.first()) {
            return metadata && (mh == other_mh);
        }
        metadata && self.signatures.len() == other.signatures.len()
    }
}
