use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{DirBuilder, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::prelude::*;
use crate::signature::Signature;
use crate::Error as FracmashError;

/// An abstraction for any place where we can store data.
pub trait Storage {
    /// Save bytes into path
    fn save(&self, path: &str, content: &[u8]) -> Result<String, FracmashError>;

    /// Load bytes from path
    fn load(&self, path: &str) -> Result<Vec<u8>, FracmashError>;

    /// A human-readable description of where this storage lives.
    fn spec(&self) -> String;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path can't be empty")]
    EmptyPathError,

    #[error("path not found: {0}")]
    PathNotFoundError(String),

    #[error("error reading data from {0}")]
    DataReadError(String),

    #[error("storage is read-only: {0}")]
    ReadOnly(String),
}

#[derive(Clone)]
pub struct InnerStorage(Arc<Mutex<dyn Storage>>);

impl InnerStorage {
    pub fn new(inner: impl Storage + 'static) -> InnerStorage {
        InnerStorage(Arc::new(Mutex::new(inner)))
    }

    /// Load and parse one signature file from this storage. Multi-signature
    /// files contribute their first entry.
    pub fn load_sig(&self, path: &str) -> Result<SigStore, FracmashError> {
        let raw = self.load(path)?;
        let sig = Signature::from_reader(&raw[..])
            .map_err(|e| e.while_loading(path))?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::DataReadError(path.into()))?;

        Ok(SigStore::from_sig(sig, path.into()))
    }

    pub fn save_sig(&self, path: &str, sig: Signature) -> Result<String, FracmashError> {
        let mut buffer = vec![];
        {
            sig.to_writer(&mut buffer)?;
        }
        self.save(path, &buffer)
    }
}

impl Storage for InnerStorage {
    fn save(&self, path: &str, content: &[u8]) -> Result<String, FracmashError> {
        self.0.save(path, content)
    }
    fn load(&self, path: &str) -> Result<Vec<u8>, FracmashError> {
        self.0.load(path)
    }
    fn spec(&self) -> String {
        self.0.spec()
    }
}

impl<L> Storage for Mutex<L>
where
    L: ?Sized + Storage,
{
    fn save(&self, path: &str, content: &[u8]) -> Result<String, FracmashError> {
        self.lock().unwrap().save(path, content)
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, FracmashError> {
        self.lock().unwrap().load(path)
    }

    fn spec(&self) -> String {
        self.lock().unwrap().spec()
    }
}

/// Store files locally into a directory
#[derive(TypedBuilder, Debug, Clone, Default)]
pub struct FSStorage {
    /// absolute path for the directory where data is saved.
    fullpath: PathBuf,
    subdir: String,
}

impl FSStorage {
    pub fn new(location: &str, subdir: &str) -> FSStorage {
        let mut fullpath = PathBuf::new();
        fullpath.push(location);
        fullpath.push(subdir);

        FSStorage {
            fullpath,
            subdir: subdir.into(),
        }
    }

    pub fn set_base(&mut self, location: &str) {
        let mut fullpath = PathBuf::new();
        fullpath.push(location);
        fullpath.push(&self.subdir);
        self.fullpath = fullpath;
    }
}

impl Storage for FSStorage {
    fn save(&self, path: &str, content: &[u8]) -> Result<String, FracmashError> {
        if path.is_empty() {
            return Err(StorageError::EmptyPathError.into());
        }

        let fpath = self.fullpath.join(path);
        DirBuilder::new()
            .recursive(true)
            .create(fpath.parent().unwrap())?;

        let file = File::create(&fpath)?;
        let mut buf_writer = BufWriter::new(file);
        buf_writer.write_all(content)?;
        Ok(path.into())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, FracmashError> {
        let path = self.fullpath.join(path);
        let file = File::open(path)?;
        let mut buf_reader = BufReader::new(file);
        let mut contents = Vec::new();
        buf_reader.read_to_end(&mut contents)?;
        Ok(contents)
    }

    fn spec(&self) -> String {
        format!("fs://{}", self.fullpath.display())
    }
}

/// Keep data in memory, mostly for transient collections and tests.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    sigs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> MemStorage {
        Default::default()
    }
}

impl Storage for MemStorage {
    fn save(&self, path: &str, content: &[u8]) -> Result<String, FracmashError> {
        if path.is_empty() {
            return Err(StorageError::EmptyPathError.into());
        }
        self.sigs
            .lock()
            .unwrap()
            .insert(path.into(), content.to_vec());
        Ok(path.into())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, FracmashError> {
        self.sigs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::PathNotFoundError(path.into()).into())
    }

    fn spec(&self) -> String {
        "memory://".into()
    }
}

#[ouroboros::self_referencing]
pub struct ZipStorage {
    mapping: Option<memmap2::Mmap>,

    #[borrows(mapping)]
    #[covariant]
    archive: piz::ZipArchive<'this>,

    subdir: Option<String>,
    path: Option<String>,

    #[borrows(archive)]
    #[covariant]
    metadata: Metadata<'this>,
}

pub type Metadata<'a> = BTreeMap<&'a OsStr, &'a piz::read::FileMetadata<'a>>;

fn lookup<'a, P: AsRef<Path>>(
    metadata: &'a Metadata,
    path: P,
) -> Result<&'a piz::read::FileMetadata<'a>, FracmashError> {
    let path = path.as_ref();
    metadata
        .get(&path.as_os_str())
        .ok_or_else(|| StorageError::PathNotFoundError(path.to_str().unwrap().into()).into())
        .map(|entry| *entry)
}

fn find_subdirs(archive: &piz::ZipArchive) -> Result<Option<String>, FracmashError> {
    let subdirs: Vec<_> = archive
        .entries()
        .iter()
        .filter(|entry| entry.is_dir())
        .collect();
    if subdirs.len() == 1 {
        Ok(Some(
            subdirs[0].path.as_str().into(),
        ))
    } else {
        Ok(None)
    }
}

impl Storage for ZipStorage {
    fn save(&self, _path: &str, _content: &[u8]) -> Result<String, FracmashError> {
        Err(StorageError::ReadOnly(self.path().unwrap_or_default()).into())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, FracmashError> {
        let metadata = self.borrow_metadata();

        let entry = lookup(metadata, path).or_else(|_| {
            if let Some(subdir) = self.borrow_subdir() {
                lookup(metadata, subdir.to_owned() + path)
                    .map_err(|_| StorageError::PathNotFoundError(path.into()))
            } else {
                Err(StorageError::PathNotFoundError(path.into()))
            }
        })?;

        let mut reader = BufReader::new(
            self.borrow_archive()
                .read(entry)
                .map_err(|_| StorageError::DataReadError(path.into()))?,
        );
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents)?;

        Ok(contents)
    }

    fn spec(&self) -> String {
        format!("zip://{}", self.path().unwrap_or_default())
    }
}

impl ZipStorage {
    pub fn from_file<P: AsRef<Path>>(location: P) -> Result<Self, FracmashError> {
        let location = location.as_ref();
        let zip_file = File::open(location)?;
        let mapping = unsafe { memmap2::Mmap::map(&zip_file)? };

        let mut storage = ZipStorageBuilder {
            mapping: Some(mapping),
            archive_builder: |mapping: &Option<memmap2::Mmap>| {
                piz::ZipArchive::new(mapping.as_ref().unwrap()).unwrap()
            },
            metadata_builder: |archive: &piz::ZipArchive| {
                archive
                    .entries()
                    .iter()
                    .map(|entry| (entry.path.as_os_str(), entry))
                    .collect()
            },
            subdir: None,
            path: Some(location.to_str().expect("invalid utf-8 in path").to_owned()),
        }
        .build();

        let subdir = find_subdirs(storage.borrow_archive())?;
        storage.with_mut(|fields| *fields.subdir = subdir);

        Ok(storage)
    }

    pub fn path(&self) -> Option<String> {
        self.borrow_path().clone()
    }

    pub fn subdir(&self) -> Option<String> {
        self.borrow_subdir().clone()
    }

    pub fn set_subdir(&mut self, path: String) {
        self.with_mut(|fields| *fields.subdir = Some(path))
    }

    pub fn filenames(&self) -> Result<Vec<String>, FracmashError> {
        Ok(self
            .borrow_archive()
            .entries()
            .iter()
            .map(|entry| entry.path.as_str().into())
            .collect())
    }
}

/// A lazily-loaded signature plus the metadata needed to find it again.
#[derive(TypedBuilder, Default)]
pub struct SigStore {
    #[builder(setter(into))]
    filename: String,

    #[builder(setter(into))]
    name: String,

    storage: Option<InnerStorage>,

    #[builder(setter(into), default)]
    data: OnceCell<Signature>,
}

impl SigStore {
    pub fn from_sig(sig: Signature, filename: String) -> Self {
        let name = sig.name();
        SigStore {
            filename,
            name,
            storage: None,
            data: OnceCell::with_value(sig),
        }
    }

    pub fn lazy(filename: String, name: String, storage: InnerStorage) -> Self {
        SigStore {
            filename,
            name,
            storage: Some(storage),
            data: OnceCell::new(),
        }
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn filename(&self) -> String {
        self.filename.clone()
    }

    pub fn data(&self) -> Result<&Signature, FracmashError> {
        if let Some(sig) = self.data.get() {
            return Ok(sig);
        }

        if let Some(storage) = &self.storage {
            let raw = storage.load(&self.filename)?;
            let sig = Signature::from_reader(&raw[..])
                .map_err(|e| e.while_loading(&self.filename))?
                .into_iter()
                .next()
                .ok_or_else(|| StorageError::DataReadError(self.filename.clone()))?;

            Ok(self.data.get_or_init(|| sig))
        } else {
            Err(StorageError::DataReadError(self.filename.clone()).into())
        }
    }

    pub fn into_signature(self) -> Result<Signature, FracmashError> {
        self.data()?;
        Ok(self.data.into_inner().unwrap())
    }
}

impl std::fmt::Debug for SigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigStore [filename: {}, name: {}]", self.filename, self.name)
    }
}

impl From<SigStore> for Signature {
    fn from(other: SigStore) -> Signature {
        other.into_signature().expect("error loading signature data")
    }
}

impl From<Signature> for SigStore {
    fn from(other: Signature) -> SigStore {
        let filename = other.filename();
        SigStore::from_sig(other, filename)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmd::ComputeParameters;

    fn test_sig(name: &str) -> Signature {
        let params = ComputeParameters::builder()
            .ksizes(vec![21])
            .scaled(1u64)
            .num_hashes(0u32)
            .build();
        let mut sig = Signature::from_params(&params);
        sig.set_name(name);
        sig.add_sequence(b"TGCCGCCCAGCACCGGGTGACTAGGTTGAGCCATGATTAACCTGCAATGA", false)
            .unwrap();
        sig
    }

    #[test]
    fn mem_storage_roundtrip() {
        let storage = InnerStorage::new(MemStorage::new());
        let sig = test_sig("mem-test");

        storage.save_sig("a/sig1", sig.clone()).unwrap();
        let loaded = storage.load_sig("a/sig1").unwrap();
        assert_eq!(loaded.name(), "mem-test");
        assert_eq!(loaded.data().unwrap().md5sum(), sig.md5sum());
    }

    #[test]
    fn mem_storage_missing_path() {
        let storage = InnerStorage::new(MemStorage::new());
        assert!(storage.load("nope").is_err());
    }

    #[test]
    fn fs_storage_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = InnerStorage::new(FSStorage::new(dir.path().to_str().unwrap(), ""));

        storage.save("x.sig", b"hello").unwrap();
        assert_eq!(storage.load("x.sig").unwrap(), b"hello");
        assert!(storage.save("", b"nope").is_err());
    }
}
