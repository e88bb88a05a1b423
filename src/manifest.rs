use std::collections::{HashMap, HashSet};
use std::convert::TryInto;
use std::fmt::Write as FmtWrite;
use std::fs::File;
use std::io::{Read, Write};
use std::ops::{Add, AddAssign, Deref};
use std::path::Path;

use camino::Utf8PathBuf as PathBuf;
use getset::{CopyGetters, Getters, Setters};
use itertools::Itertools;
use serde::de;
use serde::{Deserialize, Serialize};

use crate::encodings::HashFunctions;
use crate::picklist::Picklist;
use crate::prelude::*;
use crate::signature::SigsTrait;
use crate::Result;

/// One catalog row per sketch in a collection.
#[derive(Debug, Serialize, Deserialize, Clone, CopyGetters, Getters, Setters, Eq)]
pub struct Record {
    #[getset(get = "pub", set = "pub")]
    internal_location: PathBuf,

    #[getset(get = "pub", set = "pub")]
    md5: String,

    #[getset(get = "pub")]
    md5short: String,

    #[getset(get_copy = "pub", set = "pub")]
    ksize: u32,

    moltype: String,

    #[getset(get_copy = "pub")]
    num: u32,

    #[getset(get_copy = "pub")]
    scaled: u64,

    #[getset(get_copy = "pub")]
    n_hashes: usize,

    #[getset(get_copy = "pub")]
    #[serde(default = "default_seed")]
    seed: u64,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(serialize_with = "intbool", deserialize_with = "to_bool")]
    with_abundance: bool,

    #[getset(get = "pub", set = "pub")]
    name: String,

    #[getset(get = "pub", set = "pub")]
    filename: String,
}

fn default_seed() -> u64 {
    crate::DEFAULT_SEED
}

fn intbool<S>(x: &bool, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if *x {
        s.serialize_i32(1)
    } else {
        s.serialize_i32(0)
    }
}

fn to_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: de::Deserializer<'de>,
{
    match String::deserialize(deserializer)?
        .to_ascii_lowercase()
        .as_ref()
    {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(de::Error::invalid_value(
            de::Unexpected::Str(other),
            &"0/1, true/false, True/False are the only supported values",
        )),
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.ksize == other.ksize
            && self.moltype == other.moltype
            && self.num == other.num
            && self.scaled == other.scaled
            && self.with_abundance == other.with_abundance
    }
}

impl Record {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        internal_location: PathBuf,
        md5: String,
        ksize: u32,
        moltype: String,
        num: u32,
        scaled: u64,
        n_hashes: usize,
        seed: u64,
        with_abundance: bool,
        name: String,
        filename: String,
    ) -> Self {
        let md5short = md5.chars().take(8).collect();
        Self {
            internal_location,
            md5,
            md5short,
            ksize,
            moltype,
            num,
            scaled,
            n_hashes,
            seed,
            with_abundance,
            name,
            filename,
        }
    }

    pub fn from_sig(sig: &Signature, path: &str) -> Vec<Self> {
        sig.iter()
            .map(|mh| {
                let md5 = mh.md5sum();
                let md5short = md5[0..8].into();

                // manifest ksizes are residue-denominated for protein
                // family moltypes
                let ksize = if mh.hash_function().dna() {
                    mh.ksize() as u32
                } else {
                    mh.ksize() as u32 / 3
                };

                Self {
                    internal_location: path.into(),
                    moltype: mh.hash_function().to_string(),
                    name: sig.name(),
                    ksize,
                    md5,
                    md5short,
                    with_abundance: mh.track_abundance(),
                    filename: sig.filename(),
                    n_hashes: mh.size(),
                    seed: mh.seed(),
                    num: mh.num(),
                    scaled: mh.scaled(),
                }
            })
            .collect()
    }

    pub fn moltype(&self) -> HashFunctions {
        self.moltype.as_str().try_into().unwrap()
    }

    pub fn check_compatible(&self, other: &Record) -> Result<()> {
        use crate::Error;

        if self.ksize() != other.ksize() {
            return Err(Error::MismatchKSizes);
        }
        if self.moltype() != other.moltype() {
            return Err(Error::MismatchMoltype);
        }
        Ok(())
    }
}

/// Tabular catalog of sketches and their storage locations.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct Manifest {
    records: Vec<Record>,
}

impl Manifest {
    pub fn from_reader<R: Read>(rdr: R) -> Result<Self> {
        let mut records = vec![];

        let mut rdr = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_reader(rdr);
        for result in rdr.deserialize() {
            let record: Record = result?;
            records.push(record);
        }
        Ok(Manifest { records })
    }

    /// Load from a file; `.gz` is transparent.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (rdr, _format) = niffler::from_path(path.as_ref())?;
        Manifest::from_reader(rdr)
    }

    pub fn to_writer<W: Write>(&self, mut wtr: W) -> Result<()> {
        wtr.write_all(b"# SOURMASH-MANIFEST-VERSION: 1.0\n")?;

        let mut wtr = csv::Writer::from_writer(wtr);

        for record in &self.records {
            wtr.serialize(record)?;
        }

        Ok(())
    }

    /// Write to a file through a temp file + rename, so readers never see
    /// a partial manifest.
    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        self.to_writer(temp.as_file())?;
        temp.persist(path)
            .map_err(|e| crate::Error::from(std::io::Error::from(e.error)))?;
        Ok(())
    }

    /// Storage locations referenced by the current records. May
    /// over-approximate when a picklist was applied before `select`.
    pub fn locations(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.internal_location.to_string())
            .unique()
            .collect()
    }

    pub fn internal_locations(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.internal_location.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Keep only records passing `f`.
    pub fn filter_rows<F>(&self, f: F) -> Self
    where
        F: Fn(&Record) -> bool,
    {
        let records = self.records.iter().filter(|r| f(r)).cloned().collect();
        Manifest { records }
    }

    /// Keep only records whose named column values pass `f`. Unknown
    /// column names contribute empty strings.
    pub fn filter_on_columns<F>(&self, f: F, col_names: &[&str]) -> Self
    where
        F: Fn(&[String]) -> bool,
    {
        self.filter_rows(|row| {
            let values: Vec<String> = col_names
                .iter()
                .map(|col| match *col {
                    "internal_location" => row.internal_location().to_string(),
                    "md5" => row.md5().clone(),
                    "md5short" => row.md5short().clone(),
                    "ksize" => row.ksize().to_string(),
                    "moltype" => row.moltype().to_string(),
                    "num" => row.num().to_string(),
                    "scaled" => row.scaled().to_string(),
                    "n_hashes" => row.n_hashes().to_string(),
                    "seed" => row.seed().to_string(),
                    "with_abundance" => (row.with_abundance() as i32).to_string(),
                    "name" => row.name().clone(),
                    "filename" => row.filename().clone(),
                    _ => String::new(),
                })
                .collect();
            f(&values)
        })
    }

    /// Distill the current records into an md5 picklist, for querying
    /// backends that do not share this manifest's storage.
    pub fn to_picklist(&self) -> Picklist {
        Picklist::from_md5s(self.records.iter().map(|r| r.md5().clone()))
    }

    /// Membership by md5.
    pub fn contains(&self, sig: &Signature) -> bool {
        let md5 = sig.md5sum();
        self.records.iter().any(|r| r.md5() == &md5)
    }

    pub fn summarize(&self) -> Vec<RecordSummary> {
        let mut summary_map: HashMap<(u32, String, u32, u64, bool), RecordSummary> = HashMap::new();

        for record in self.iter() {
            let key = (
                record.ksize(),
                record.moltype.clone(),
                record.num,
                record.scaled,
                record.with_abundance(),
            );
            let entry = summary_map.entry(key).or_insert_with(|| RecordSummary {
                ksize: record.ksize(),
                moltype: record.moltype.clone(),
                num: record.num,
                scaled: record.scaled,
                with_abundance: record.with_abundance(),
                count: 0,
                total_n_hashes: 0,
            });

            entry.count += 1;
            entry.total_n_hashes += record.n_hashes;
        }

        summary_map.into_values().collect()
    }
}

impl Select for Manifest {
    fn select(self, selection: &Selection) -> Result<Self> {
        let rows = self.records.iter().filter(|row| {
            let mut valid = true;
            valid = if let Some(ksize) = selection.ksize() {
                row.ksize == ksize
            } else {
                valid
            };
            valid = if let Some(abund) = selection.abund() {
                valid && row.with_abundance() == abund
            } else {
                valid
            };
            valid = if let Some(moltype) = selection.moltype() {
                valid && row.moltype() == moltype
            } else {
                valid
            };
            valid = if let Some(scaled) = selection.scaled() {
                // num sigs have scaled == 0 and are not included
                valid && row.scaled != 0 && row.scaled <= scaled as u64
            } else {
                valid
            };
            if selection.containment().unwrap_or(false) {
                valid = valid && row.scaled != 0;
            }
            valid = if let Some(num) = selection.num() {
                valid && row.num == num
            } else {
                valid
            };
            valid = if let Some(picklist) = selection.picklist() {
                valid && picklist.matches_manifest_row(row)
            } else {
                valid
            };
            valid
        });

        Ok(Manifest {
            records: rows.cloned().collect(),
        })
    }
}

impl AddAssign for Manifest {
    fn add_assign(&mut self, other: Self) {
        let mut seen: HashSet<(PathBuf, String)> = self
            .records
            .iter()
            .map(|r| (r.internal_location.clone(), r.md5.clone()))
            .collect();

        for record in other.records {
            let key = (record.internal_location.clone(), record.md5.clone());
            if seen.insert(key) {
                self.records.push(record);
            }
        }
    }
}

impl Add for Manifest {
    type Output = Manifest;

    fn add(mut self, other: Self) -> Self::Output {
        self += other;
        self
    }
}

impl From<Vec<Record>> for Manifest {
    fn from(records: Vec<Record>) -> Self {
        Manifest { records }
    }
}

impl From<&[PathBuf]> for Manifest {
    fn from(paths: &[PathBuf]) -> Self {
        let records: Vec<Record> = paths
            .iter()
            .flat_map(|p| {
                let recs: Vec<Record> = Signature::from_path(p)
                    .unwrap_or_else(|_| panic!("Error processing {:?}", p))
                    .into_iter()
                    .flat_map(|v| Record::from_sig(&v, p.as_str()))
                    .collect();
                recs
            })
            .collect();

        Manifest { records }
    }
}

impl From<&PathBuf> for Manifest {
    fn from(pathlist: &PathBuf) -> Self {
        use std::io::{BufRead, BufReader};

        let file = File::open(pathlist).unwrap_or_else(|_| panic!("Failed to open {:?}", pathlist));
        let reader = BufReader::new(file);

        let paths: Vec<PathBuf> = reader
            .lines()
            .map(|line| line.unwrap_or_else(|_| panic!("Failed to read line from {:?}", pathlist)))
            .map(PathBuf::from)
            .collect();

        paths.as_slice().into()
    }
}

impl Deref for Manifest {
    type Target = Vec<Record>;

    fn deref(&self) -> &Self::Target {
        &self.records
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecordSummary {
    ksize: u32,
    moltype: String,
    num: u32,
    scaled: u64,
    with_abundance: bool,
    count: usize,
    total_n_hashes: usize,
}

impl std::fmt::Display for RecordSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} sketches with {}, k={}, scaled={}  {} total hashes",
            self.count, self.moltype, self.ksize, self.scaled, self.total_n_hashes
        )
    }
}

pub fn write_summary(summaries: &[RecordSummary]) -> String {
    let mut output = String::new();
    FmtWrite::write_str(&mut output, "num signatures: ").unwrap();
    writeln!(
        output,
        "{}",
        summaries.iter().map(|s| s.count).sum::<usize>()
    )
    .unwrap();
    FmtWrite::write_str(&mut output, "total hashes: ").unwrap();
    writeln!(
        output,
        "{}",
        summaries.iter().map(|s| s.total_n_hashes).sum::<usize>()
    )
    .unwrap();
    FmtWrite::write_str(&mut output, "summary of sketches:\n").unwrap();
    for summary in summaries {
        writeln!(output, "   {}", summary).unwrap();
    }

    output
}
