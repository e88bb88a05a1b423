use std::cmp::Ordering;
use std::fmt::Write;
use std::iter::Peekable;
use std::sync::Mutex;

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::ani_utils::{
    containment_to_distance, jaccard_to_distance, set_size_chernoff, AniResult,
};
use crate::encodings::HashFunctions;
use crate::signature::SigsTrait;
use crate::Error;

pub fn max_hash_for_scaled(scaled: u64) -> u64 {
    match scaled {
        0 => 0,
        1 => u64::MAX,
        _ => (u64::MAX as f64 / scaled as f64) as u64,
    }
}

pub fn scaled_for_max_hash(max_hash: u64) -> u64 {
    match max_hash {
        0 => 0,
        _ => u64::MAX / max_hash,
    }
}

/// A bottom-sketch (`num`) or FracMinHash (`scaled`) of k-mer hashes,
/// with optional per-hash abundances.
///
/// `mins` is kept sorted; `abunds`, when present, is parallel to `mins`.
/// Exactly one of `num` / `max_hash` is nonzero for a useful sketch.
#[derive(Debug, TypedBuilder)]
pub struct KmerMinHash {
    num: u32,
    ksize: u32,

    #[builder(setter(into), default = HashFunctions::Murmur64Dna)]
    hash_function: HashFunctions,

    #[builder(default = crate::DEFAULT_SEED)]
    seed: u64,

    #[builder(default = 0u64)]
    max_hash: u64,

    #[builder(default)]
    mins: Vec<u64>,

    #[builder(default)]
    abunds: Option<Vec<u64>>,

    #[builder(default)]
    md5sum: Mutex<Option<String>>,
}

impl PartialEq for KmerMinHash {
    fn eq(&self, other: &KmerMinHash) -> bool {
        self.md5sum() == other.md5sum()
    }
}

impl Eq for KmerMinHash {}

impl Clone for KmerMinHash {
    fn clone(&self) -> Self {
        KmerMinHash {
            num: self.num,
            ksize: self.ksize,
            hash_function: self.hash_function,
            seed: self.seed,
            max_hash: self.max_hash,
            mins: self.mins.clone(),
            abunds: self.abunds.clone(),
            md5sum: Mutex::new(Some(self.md5sum())),
        }
    }
}

impl Default for KmerMinHash {
    fn default() -> KmerMinHash {
        KmerMinHash {
            num: 1000,
            ksize: 21,
            hash_function: HashFunctions::Murmur64Dna,
            seed: crate::DEFAULT_SEED,
            max_hash: 0,
            mins: Vec::with_capacity(1000),
            abunds: None,
            md5sum: Mutex::new(None),
        }
    }
}

impl KmerMinHash {
    pub fn new(
        scaled: u64,
        ksize: u32,
        hash_function: HashFunctions,
        seed: u64,
        track_abundance: bool,
        num: u32,
    ) -> KmerMinHash {
        let mins = if num > 0 {
            Vec::with_capacity(num as usize)
        } else {
            Vec::with_capacity(1000)
        };

        let abunds = if track_abundance {
            Some(Vec::with_capacity(mins.capacity()))
        } else {
            None
        };

        KmerMinHash {
            num,
            ksize,
            hash_function,
            seed,
            max_hash: max_hash_for_scaled(scaled),
            mins,
            abunds,
            md5sum: Mutex::new(None),
        }
    }

    /// An empty sketch with the same parameters as `self`.
    pub fn copy_and_clear(&self) -> KmerMinHash {
        KmerMinHash {
            num: self.num,
            ksize: self.ksize,
            hash_function: self.hash_function,
            seed: self.seed,
            max_hash: self.max_hash,
            mins: vec![],
            abunds: self.abunds.as_ref().map(|_| vec![]),
            md5sum: Mutex::new(None),
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn max_hash(&self) -> u64 {
        self.max_hash
    }

    pub fn scaled(&self) -> u64 {
        scaled_for_max_hash(self.max_hash)
    }

    pub fn is_empty(&self) -> bool {
        self.mins.is_empty()
    }

    pub fn clear(&mut self) {
        self.mins.clear();
        if let Some(ref mut abunds) = self.abunds {
            abunds.clear();
        }
        self.reset_md5sum();
    }

    pub fn track_abundance(&self) -> bool {
        self.abunds.is_some()
    }

    pub fn enable_abundance(&mut self) -> Result<(), Error> {
        if !self.mins.is_empty() {
            return Err(Error::NonEmptyMinHash {
                message: "track_abundance=True".into(),
            });
        }

        self.abunds = Some(vec![]);
        Ok(())
    }

    pub fn disable_abundance(&mut self) {
        self.abunds = None;
        self.reset_md5sum();
    }

    pub fn mins(&self) -> Vec<u64> {
        self.mins.clone()
    }

    pub fn iter_mins(&self) -> impl Iterator<Item = &u64> {
        self.mins.iter()
    }

    pub fn abunds(&self) -> Option<Vec<u64>> {
        self.abunds.clone()
    }

    pub fn to_vec_abunds(&self) -> Vec<(u64, u64)> {
        if let Some(abunds) = &self.abunds {
            self.mins.iter().copied().zip(abunds.iter().copied()).collect()
        } else {
            self.mins
                .iter()
                .copied()
                .zip(std::iter::repeat(1))
                .collect()
        }
    }

    /// Total abundance over all hashes (sketch size for flat sketches).
    pub fn sum_abunds(&self) -> u64 {
        if let Some(abunds) = &self.abunds {
            abunds.iter().sum()
        } else {
            self.mins.len() as u64
        }
    }

    fn reset_md5sum(&self) {
        let mut data = self.md5sum.lock().unwrap();
        if data.is_some() {
            *data = None;
        }
    }

    fn compute_md5sum(&self) -> String {
        let mut buffer = String::with_capacity(20);

        let mut md5_ctx = md5::Context::new();
        write!(&mut buffer, "{}", self.ksize()).unwrap();
        md5_ctx.consume(&buffer);
        buffer.clear();
        for x in &self.mins {
            write!(&mut buffer, "{}", x).unwrap();
            md5_ctx.consume(&buffer);
            buffer.clear();
        }
        if let Some(abunds) = &self.abunds {
            for x in abunds {
                write!(&mut buffer, "{}", x).unwrap();
                md5_ctx.consume(&buffer);
                buffer.clear();
            }
        }
        format!("{:x}", md5_ctx.compute())
    }

    pub fn md5sum(&self) -> String {
        let mut data = self.md5sum.lock().unwrap();
        if data.is_none() {
            *data = Some(self.compute_md5sum());
        }
        data.clone().unwrap()
    }

    /// Recompute the fingerprint and compare it against the cached value
    /// (the stored one, after deserialization).
    pub fn check_md5sum(&self) -> Result<(), Error> {
        let cached = self.md5sum();
        let fresh = self.compute_md5sum();
        if cached != fresh {
            return Err(Error::Md5sumMismatch {
                expected: cached,
                computed: fresh,
            });
        }
        Ok(())
    }

    pub fn add_hash_with_abundance(&mut self, hash: u64, abundance: u64) {
        let current_max = match self.mins.last() {
            Some(&x) => x,
            None => u64::MAX,
        };

        if hash > self.max_hash && self.max_hash != 0 {
            // outside the scaled band
            return;
        }

        if self.num == 0 && self.max_hash == 0 {
            // this sketch can hold nothing
            return;
        }

        if abundance == 0 {
            return;
        }

        if self.mins.is_empty() {
            self.mins.push(hash);
            if let Some(ref mut abunds) = self.abunds {
                abunds.push(abundance);
            }
            self.reset_md5sum();
            return;
        }

        if hash <= self.max_hash || hash <= current_max || (self.mins.len() as u32) < self.num {
            // within band, smaller than the current bottom, or still growing
            let pos = match self.mins.binary_search(&hash) {
                Ok(p) => p,
                Err(p) => p,
            };

            if pos == self.mins.len() {
                self.mins.push(hash);
                if let Some(ref mut abunds) = self.abunds {
                    abunds.push(abundance);
                }
                self.reset_md5sum();
            } else if self.mins[pos] != hash {
                self.mins.insert(pos, hash);
                if let Some(ref mut abunds) = self.abunds {
                    abunds.insert(pos, abundance);
                }

                if self.num != 0 && self.mins.len() > (self.num as usize) {
                    self.mins.pop();
                    if let Some(ref mut abunds) = self.abunds {
                        abunds.pop();
                    }
                }
                self.reset_md5sum();
            } else if let Some(ref mut abunds) = self.abunds {
                abunds[pos] += abundance;
                self.reset_md5sum();
            }
        }
    }

    /// Overwrite (rather than add to) the abundance for `hash`.
    pub fn set_hash_with_abundance(&mut self, hash: u64, abundance: u64) {
        if let Ok(pos) = self.mins.binary_search(&hash) {
            if abundance == 0 {
                self.remove_hash(hash);
            } else if let Some(ref mut abunds) = self.abunds {
                abunds[pos] = abundance;
                self.reset_md5sum();
            }
        } else if abundance > 0 {
            self.add_hash_with_abundance(hash, abundance);
        }
    }

    /// Set abundances in bulk. When `clear` is set the existing contents
    /// are replaced; otherwise counts merge into existing abundances.
    /// A zero count removes the hash.
    pub fn set_abundances(&mut self, values: &[(u64, u64)], clear: bool) -> Result<(), Error> {
        if self.abunds.is_none() {
            return Err(Error::NeedsAbundance);
        }

        if clear {
            self.mins.clear();
            if let Some(ref mut abunds) = self.abunds {
                abunds.clear();
            }
            self.reset_md5sum();
        }

        for (hash, abundance) in values {
            if *abundance == 0 {
                self.remove_hash(*hash);
            } else {
                self.add_hash_with_abundance(*hash, *abundance);
            }
        }

        Ok(())
    }

    pub fn add_word(&mut self, word: &[u8]) {
        let hash = crate::_hash_murmur(word, self.seed);
        self.add_hash(hash);
    }

    pub fn remove_hash(&mut self, hash: u64) {
        if let Ok(pos) = self.mins.binary_search(&hash) {
            self.mins.remove(pos);
            if let Some(ref mut abunds) = self.abunds {
                abunds.remove(pos);
            }
            self.reset_md5sum();
        }
    }

    pub fn remove_many(&mut self, hashes: &[u64]) -> Result<(), Error> {
        for min in hashes {
            self.remove_hash(*min);
        }
        Ok(())
    }

    /// Remove every hash present in `other`. This is the mutation step of
    /// gather's cover loop.
    pub fn remove_from(&mut self, other: &KmerMinHash) -> Result<(), Error> {
        for min in &other.mins {
            self.remove_hash(*min);
        }
        Ok(())
    }

    pub fn add_many(&mut self, hashes: &[u64]) -> Result<(), Error> {
        for min in hashes {
            self.add_hash(*min);
        }
        Ok(())
    }

    pub fn add_many_with_abund(&mut self, hashes: &[(u64, u64)]) -> Result<(), Error> {
        for item in hashes {
            self.add_hash_with_abundance(item.0, item.1);
        }
        Ok(())
    }

    pub fn add_from(&mut self, other: &KmerMinHash) -> Result<(), Error> {
        self.check_compatible(other)?;
        if other.track_abundance() {
            self.add_many_with_abund(&other.to_vec_abunds())
        } else {
            self.add_many(&other.mins)
        }
    }

    /// In-place union. Abundances are summed; for `num` sketches the
    /// result keeps the capacity.
    pub fn merge(&mut self, other: &KmerMinHash) -> Result<(), Error> {
        self.check_compatible(other)?;
        let max_size = self.mins.len() + other.mins.len();
        let mut merged: Vec<u64> = Vec::with_capacity(max_size);
        let mut merged_abunds: Option<Vec<u64>> =
            self.abunds.as_ref().map(|_| Vec::with_capacity(max_size));

        {
            let mut it1 = self.to_vec_abunds().into_iter().peekable();
            let mut it2 = other.to_vec_abunds().into_iter().peekable();

            loop {
                let (hash, abund) = match (it1.peek(), it2.peek()) {
                    (None, None) => break,
                    (Some(_), None) => it1.next().unwrap(),
                    (None, Some(_)) => it2.next().unwrap(),
                    (Some((h1, _)), Some((h2, _))) => match h1.cmp(h2) {
                        Ordering::Less => it1.next().unwrap(),
                        Ordering::Greater => it2.next().unwrap(),
                        Ordering::Equal => {
                            let (h, a1) = it1.next().unwrap();
                            let (_, a2) = it2.next().unwrap();
                            (h, a1 + a2)
                        }
                    },
                };
                merged.push(hash);
                if let Some(ref mut abunds) = merged_abunds {
                    abunds.push(abund);
                }
            }
        }

        let to_take = if self.num == 0 {
            merged.len()
        } else {
            self.num as usize
        };

        merged.truncate(to_take);
        if let Some(ref mut abunds) = merged_abunds {
            abunds.truncate(to_take);
        }

        self.mins = merged;
        self.abunds = merged_abunds;
        self.reset_md5sum();
        Ok(())
    }

    pub fn count_common(&self, other: &KmerMinHash, downsample: bool) -> Result<u64, Error> {
        if downsample && self.max_hash != other.max_hash {
            let (first, second) = if self.max_hash < other.max_hash {
                (self, other)
            } else {
                (other, self)
            };
            let downsampled_mh = second.downsample_max_hash(first.max_hash)?;
            first.count_common(&downsampled_mh, false)
        } else {
            self.check_compatible(other)?;
            let iter = if self.size() < other.size() {
                Intersection::new(self.mins.iter(), other.mins.iter())
            } else {
                Intersection::new(other.mins.iter(), self.mins.iter())
            };

            Ok(iter.count() as u64)
        }
    }

    /// Hashes in common, and the size of the capacity-respecting union.
    pub fn intersection(&self, other: &KmerMinHash) -> Result<(Vec<u64>, u64), Error> {
        self.check_compatible(other)?;

        let mut combined_mh = self.copy_and_clear();
        combined_mh.merge(self)?;
        combined_mh.merge(other)?;

        let it1 = Intersection::new(self.mins.iter(), other.mins.iter());

        // for num sketches, hashes beyond the union capacity do not count
        let i1: Vec<u64> = it1.copied().collect();
        let common: Vec<u64> = Intersection::new(i1.iter(), combined_mh.mins.iter())
            .copied()
            .collect();

        Ok((common, combined_mh.mins.len() as u64))
    }

    pub fn intersection_size(&self, other: &KmerMinHash) -> Result<(u64, u64), Error> {
        let (common, union_size) = self.intersection(other)?;
        Ok((common.len() as u64, union_size))
    }

    /// Flat intersection as a new sketch; abundances are dropped.
    pub fn intersection_sketch(&self, other: &KmerMinHash) -> Result<KmerMinHash, Error> {
        let (common, _) = self.intersection(other)?;
        let mut combined = self.copy_and_clear();
        combined.disable_abundance();
        combined.add_many(&common)?;
        Ok(combined)
    }

    /// Jaccard similarity, ignoring abundance.
    pub fn jaccard(&self, other: &KmerMinHash) -> Result<f64, Error> {
        self.check_compatible(other)?;
        let (common, size) = self.intersection_size(other)?;
        Ok(common as f64 / u64::max(1, size) as f64)
    }

    /// Angular similarity over the aligned abundance vectors.
    pub fn angular_similarity(&self, other: &KmerMinHash) -> Result<f64, Error> {
        self.check_compatible(other)?;

        let (abunds, other_abunds) = match (&self.abunds, &other.abunds) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(Error::NeedsAbundance),
        };

        let mut prod = 0;
        let mut other_iter = other.mins.iter().enumerate();
        let mut next_hash = other_iter.next();
        let a_sq: u64 = abunds.iter().map(|a| a * a).sum();
        let b_sq: u64 = other_abunds.iter().map(|a| a * a).sum();

        for (i, hash) in self.mins.iter().enumerate() {
            while let Some((j, k)) = next_hash {
                match k.cmp(hash) {
                    Ordering::Less => next_hash = other_iter.next(),
                    Ordering::Equal => {
                        prod += abunds[i] * other_abunds[j];
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
        }

        let norm_a = (a_sq as f64).sqrt();
        let norm_b = (b_sq as f64).sqrt();

        if norm_a == 0. || norm_b == 0. {
            return Ok(0.0);
        }
        let cos = f64::min(prod as f64 / (norm_a * norm_b), 1.);
        let distance = 2. * cos.acos() / std::f64::consts::PI;
        Ok(1. - distance)
    }

    /// Jaccard when either sketch is flat or `ignore_abundance`; angular
    /// similarity otherwise.
    pub fn similarity(
        &self,
        other: &KmerMinHash,
        ignore_abundance: bool,
        downsample: bool,
    ) -> Result<f64, Error> {
        if downsample && self.max_hash != other.max_hash {
            let (first, second) = if self.max_hash < other.max_hash {
                (self, other)
            } else {
                (other, self)
            };
            let downsampled_mh = second.downsample_max_hash(first.max_hash)?;
            first.similarity(&downsampled_mh, ignore_abundance, false)
        } else if ignore_abundance || self.abunds.is_none() || other.abunds.is_none() {
            self.jaccard(other)
        } else {
            self.angular_similarity(other)
        }
    }

    /// Fraction of `self` contained by `other`. Requires scaled sketches:
    /// a `num` sketch has no well-defined denominator under this model.
    pub fn contained_by(&self, other: &KmerMinHash, downsample: bool) -> Result<f64, Error> {
        if self.max_hash == 0 || other.max_hash == 0 {
            return Err(Error::NeedsScaled {
                message: "contained_by".into(),
            });
        }

        if self.mins.is_empty() {
            return Ok(0.0);
        }

        let common = self.count_common(other, downsample)?;
        Ok(common as f64 / self.size() as f64)
    }

    pub fn max_containment(&self, other: &KmerMinHash, downsample: bool) -> Result<f64, Error> {
        let c1 = self.contained_by(other, downsample)?;
        let c2 = other.contained_by(self, downsample)?;
        Ok(f64::max(c1, c2))
    }

    pub fn avg_containment(&self, other: &KmerMinHash, downsample: bool) -> Result<f64, Error> {
        let c1 = self.contained_by(other, downsample)?;
        let c2 = other.contained_by(self, downsample)?;
        Ok((c1 + c2) / 2.0)
    }

    fn downsample_max_hash(&self, max_hash: u64) -> Result<KmerMinHash, Error> {
        let mut new_mh = KmerMinHash {
            num: self.num,
            ksize: self.ksize,
            hash_function: self.hash_function,
            seed: self.seed,
            max_hash,
            mins: vec![],
            abunds: self.abunds.as_ref().map(|_| vec![]),
            md5sum: Mutex::new(None),
        };
        if self.abunds.is_some() {
            new_mh.add_many_with_abund(&self.to_vec_abunds())?;
        } else {
            new_mh.add_many(&self.mins)?;
        }
        Ok(new_mh)
    }

    /// A copy of this sketch at a coarser `scaled`. Converting a `num`
    /// sketch to `scaled` is allowed; enlarging resolution is not.
    pub fn downsample_scaled(&self, scaled: u64) -> Result<KmerMinHash, Error> {
        let old_scaled = self.scaled();
        if self.max_hash == 0 {
            // num sketch: mode conversion
            let mut new_mh = KmerMinHash::new(
                scaled,
                self.ksize,
                self.hash_function,
                self.seed,
                self.abunds.is_some(),
                0,
            );
            new_mh.add_many_with_abund(&self.to_vec_abunds())?;
            return Ok(new_mh);
        }

        if old_scaled > scaled {
            return Err(Error::CannotDownsample {
                old: old_scaled,
                new: scaled,
            });
        }

        let mut new_mh = self.downsample_max_hash(max_hash_for_scaled(scaled))?;
        new_mh.num = 0;
        Ok(new_mh)
    }

    /// A copy of this sketch at a smaller `num`. Scaled sketches cannot be
    /// converted back.
    pub fn downsample_num(&self, num: u32) -> Result<KmerMinHash, Error> {
        if self.max_hash != 0 {
            return Err(Error::CannotUpsampleScaled);
        }
        if num > self.num {
            return Err(Error::CannotDownsample {
                old: self.num as u64,
                new: num as u64,
            });
        }

        let mut new_mh = KmerMinHash::new(
            0,
            self.ksize,
            self.hash_function,
            self.seed,
            self.abunds.is_some(),
            num,
        );
        new_mh.add_many_with_abund(&self.to_vec_abunds())?;
        Ok(new_mh)
    }

    /// A copy without abundance tracking.
    pub fn flatten(&self) -> KmerMinHash {
        let mut flat = self.clone();
        flat.disable_abundance();
        flat
    }

    /// Annotate this (flat) sketch with the abundances of `from`. Hashes
    /// absent in `from` are dropped.
    pub fn inflate(&self, from: &KmerMinHash) -> Result<KmerMinHash, Error> {
        self.check_compatible(from)?;
        let from_abunds = match &from.abunds {
            Some(a) => a,
            None => return Err(Error::NeedsAbundance),
        };

        let mut new_mh = self.copy_and_clear();
        new_mh.abunds = Some(vec![]);

        let mut from_iter = from.mins.iter().zip(from_abunds.iter()).peekable();
        for hash in &self.mins {
            while let Some((fh, _)) = from_iter.peek() {
                match (*fh).cmp(hash) {
                    Ordering::Less => {
                        from_iter.next();
                    }
                    Ordering::Equal => {
                        let (_, abund) = from_iter.next().unwrap();
                        new_mh.mins.push(*hash);
                        new_mh.abunds.as_mut().unwrap().push(*abund);
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
        }

        Ok(new_mh)
    }

    /// Estimated number of distinct k-mers in the sketched dataset.
    pub fn n_unique_kmers(&self) -> u64 {
        self.mins.len() as u64 * self.scaled()
    }

    /// Whether `size × scaled` is a reliable cardinality estimate, via the
    /// Chernoff bound over the binomial sampling of hash space.
    pub fn size_is_accurate(&self, relative_error: f64, confidence: f64) -> Result<bool, Error> {
        if self.max_hash == 0 {
            return Err(Error::NeedsScaled {
                message: "size_is_accurate".into(),
            });
        }
        if self.mins.is_empty() {
            return Ok(false);
        }
        let probability = set_size_chernoff(
            self.n_unique_kmers() as f64,
            self.scaled(),
            relative_error,
        );
        Ok(probability >= confidence)
    }

    fn size_may_be_inaccurate(&self, other: &KmerMinHash) -> bool {
        let ok = self.size_is_accurate(0.2, 0.95).unwrap_or(false)
            && other.size_is_accurate(0.2, 0.95).unwrap_or(false);
        !ok
    }

    /// ANI from the containment of `self` in `other`.
    pub fn containment_ani(
        &self,
        other: &KmerMinHash,
        downsample: bool,
        estimate_ci: bool,
    ) -> Result<AniResult, Error> {
        let containment = self.contained_by(other, downsample)?;
        let scaled = u64::max(self.scaled(), other.scaled());
        let mut res = containment_to_distance(
            containment,
            self.ksize,
            scaled,
            self.n_unique_kmers(),
            None,
            estimate_ci,
        )?;
        res.size_is_inaccurate = self.size_may_be_inaccurate(other);
        Ok(res)
    }

    /// ANI from the larger of the two directional containments. The
    /// denominator of max containment is the smaller sketch.
    pub fn max_containment_ani(
        &self,
        other: &KmerMinHash,
        downsample: bool,
        estimate_ci: bool,
    ) -> Result<AniResult, Error> {
        let containment = self.max_containment(other, downsample)?;
        let scaled = u64::max(self.scaled(), other.scaled());
        let n_kmers = u64::min(self.n_unique_kmers(), other.n_unique_kmers());
        let mut res = containment_to_distance(
            containment,
            self.ksize,
            scaled,
            n_kmers,
            None,
            estimate_ci,
        )?;
        res.size_is_inaccurate = self.size_may_be_inaccurate(other);
        Ok(res)
    }

    /// Mean of the two directional containment ANIs, when both resolve.
    pub fn avg_containment_ani(&self, other: &KmerMinHash) -> Result<Option<f64>, Error> {
        let a1 = self.containment_ani(other, true, false)?;
        let a2 = other.containment_ani(self, true, false)?;
        Ok(match (a1.ani(), a2.ani()) {
            (Some(x), Some(y)) => Some((x + y) / 2.0),
            _ => None,
        })
    }

    /// ANI from Jaccard similarity, with its error bound.
    pub fn jaccard_ani(
        &self,
        other: &KmerMinHash,
        downsample: bool,
        err_threshold: Option<f64>,
    ) -> Result<AniResult, Error> {
        let jaccard = self.similarity(other, true, downsample)?;
        let scaled = u64::max(self.scaled(), other.scaled());
        let n_kmers = (self.n_unique_kmers() + other.n_unique_kmers()) / 2;
        let mut res = jaccard_to_distance(jaccard, self.ksize, scaled, n_kmers, err_threshold)?;
        res.size_is_inaccurate = self.size_may_be_inaccurate(other);
        Ok(res)
    }

    pub fn is_protein(&self) -> bool {
        self.hash_function.protein()
    }

    pub fn dayhoff(&self) -> bool {
        self.hash_function.dayhoff()
    }

    pub fn hp(&self) -> bool {
        self.hash_function.hp()
    }
}

impl SigsTrait for KmerMinHash {
    fn size(&self) -> usize {
        self.mins.len()
    }

    fn to_vec(&self) -> Vec<u64> {
        self.mins.clone()
    }

    fn ksize(&self) -> usize {
        self.ksize as usize
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn hash_function(&self) -> HashFunctions {
        self.hash_function
    }

    fn add_hash(&mut self, hash: u64) {
        self.add_hash_with_abundance(hash, 1);
    }

    fn check_compatible(&self, other: &KmerMinHash) -> Result<(), Error> {
        if self.ksize != other.ksize {
            return Err(Error::MismatchKSizes);
        }
        if self.hash_function != other.hash_function {
            return Err(Error::MismatchMoltype);
        }
        if self.max_hash != other.max_hash {
            return Err(Error::MismatchScaled);
        }
        if self.seed != other.seed {
            return Err(Error::MismatchSeed);
        }
        Ok(())
    }
}

impl Serialize for KmerMinHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let n_fields = match &self.abunds {
            Some(_) => 8,
            _ => 7,
        };

        let mut partial = serializer.serialize_struct("KmerMinHash", n_fields)?;
        partial.serialize_field("num", &self.num)?;
        partial.serialize_field("ksize", &self.ksize)?;
        partial.serialize_field("seed", &self.seed)?;
        partial.serialize_field("max_hash", &self.max_hash)?;
        partial.serialize_field("md5sum", &self.md5sum())?;
        partial.serialize_field("mins", &self.mins)?;

        if let Some(abunds) = &self.abunds {
            partial.serialize_field("abundances", abunds)?;
        }

        partial.serialize_field("molecule", &self.hash_function.to_string())?;

        partial.end()
    }
}

impl<'de> Deserialize<'de> for KmerMinHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TempSig {
            #[serde(default)]
            num: u32,
            ksize: u32,
            #[serde(default = "default_seed")]
            seed: u64,
            #[serde(default)]
            max_hash: u64,
            md5sum: String,
            mins: Vec<u64>,
            abundances: Option<Vec<u64>>,
            molecule: String,
        }

        fn default_seed() -> u64 {
            crate::DEFAULT_SEED
        }

        let tmpsig = TempSig::deserialize(deserializer)?;

        if tmpsig.num != 0 && tmpsig.max_hash != 0 {
            return Err(serde::de::Error::custom(
                "sketch declares both num and max_hash",
            ));
        }

        let hash_function = HashFunctions::try_from(tmpsig.molecule.as_str())
            .map_err(serde::de::Error::custom)?;

        // Some historical files carry unordered mins; re-sort on load.
        let (mins, abunds) = if let Some(abunds) = tmpsig.abundances {
            let mut values: Vec<(_, _)> = tmpsig.mins.into_iter().zip(abunds).collect();
            values.sort_unstable();
            let mins = values.iter().map(|(v, _)| *v).collect();
            let abunds = values.iter().map(|(_, v)| *v).collect();
            (mins, Some(abunds))
        } else {
            let mut values = tmpsig.mins;
            values.sort_unstable();
            (values, None)
        };

        Ok(KmerMinHash {
            num: tmpsig.num,
            ksize: tmpsig.ksize,
            seed: tmpsig.seed,
            max_hash: tmpsig.max_hash,
            md5sum: Mutex::new(Some(tmpsig.md5sum)),
            mins,
            abunds,
            hash_function,
        })
    }
}

struct Intersection<T, I: Iterator<Item = T>> {
    iter: Peekable<I>,
    other: Peekable<I>,
}

impl<T, I: Iterator<Item = T>> Intersection<T, I> {
    pub fn new(left: I, right: I) -> Self {
        Intersection {
            iter: left.peekable(),
            other: right.peekable(),
        }
    }
}

impl<T: Ord, I: Iterator<Item = T>> Iterator for Intersection<T, I> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let res = match (self.iter.peek(), self.other.peek()) {
                (Some(ref left_key), Some(ref right_key)) => left_key.cmp(right_key),
                _ => return None,
            };

            match res {
                Ordering::Less => {
                    self.iter.next();
                }
                Ordering::Greater => {
                    self.other.next();
                }
                Ordering::Equal => {
                    self.other.next();
                    return self.iter.next();
                }
            }
        }
    }
}
