use std::io::Write;
use std::ops::{Deref, DerefMut};

use camino::Utf8Path as Path;

use crate::encodings::Idx;
use crate::manifest::{Manifest, Record};
use crate::prelude::*;
use crate::signature::Signature;
use crate::storage::{FSStorage, InnerStorage, MemStorage, SigStore, ZipStorage};
use crate::{Error, Result};

/// A manifest plus the storage its signatures live in.
pub struct Collection {
    manifest: Manifest,
    storage: InnerStorage,
}

/// A [`Collection`] whose sketches are known to share compatible
/// parameters, as indexes require.
pub struct CollectionSet {
    collection: Collection,
}

impl Deref for CollectionSet {
    type Target = Collection;

    fn deref(&self) -> &Self::Target {
        &self.collection
    }
}

impl DerefMut for CollectionSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.collection
    }
}

impl TryFrom<Collection> for CollectionSet {
    type Error = Error;

    fn try_from(collection: Collection) -> Result<Self> {
        let first = if let Some(first) = collection.manifest.first() {
            first
        } else {
            // an empty collection is consistent
            return Ok(Self { collection });
        };

        collection
            .manifest
            .iter()
            .skip(1)
            .try_for_each(|c| first.check_compatible(c))?;

        Ok(Self { collection })
    }
}

impl CollectionSet {
    pub fn into_inner(self) -> Collection {
        self.collection
    }
}

impl Collection {
    pub fn new(manifest: Manifest, storage: InnerStorage) -> Self {
        Self { manifest, storage }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Idx, &Record)> {
        self.manifest.iter().enumerate().map(|(i, r)| (i as Idx, r))
    }

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.len() == 0
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn set_manifest(&mut self, manifest: Manifest) {
        self.manifest = manifest;
    }

    pub fn storage(&self) -> &InnerStorage {
        &self.storage
    }

    /// Open a zip collection with an embedded manifest.
    pub fn from_zipfile<P: AsRef<Path>>(zipfile: P) -> Result<Self> {
        let storage = ZipStorage::from_file(zipfile.as_ref().as_std_path())?;
        // the manifest lives at a standard location in the archive
        let manifest = Manifest::from_reader(storage.load("SOURMASH-MANIFEST.csv")?.as_slice())?;
        Ok(Self {
            manifest,
            storage: InnerStorage::new(storage),
        })
    }

    /// An in-memory collection from already-loaded signatures.
    pub fn from_sigs(sigs: Vec<Signature>) -> Result<Self> {
        let storage = InnerStorage::new(MemStorage::new());

        let mut records = vec![];
        for (i, sig) in sigs.into_iter().enumerate() {
            let path = format!("{}", i);
            let mut record = Record::from_sig(&sig, &path);
            let path = storage.save_sig(&path, sig)?;
            record.iter_mut().for_each(|rec| {
                rec.set_internal_location(path.clone().into());
            });
            records.extend(record);
        }

        Ok(Self {
            manifest: records.into(),
            storage,
        })
    }

    /// A collection over signature files on disk (e.g. a directory of
    /// `.sig` files).
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let records: Vec<Record> = paths
            .iter()
            .flat_map(|p| {
                let recs: Vec<Record> = Signature::from_path(p.as_ref())
                    .unwrap_or_else(|_| panic!("Error processing {:?}", p.as_ref()))
                    .into_iter()
                    .flat_map(|v| Record::from_sig(&v, p.as_ref().as_str()))
                    .collect();
                recs
            })
            .collect();

        Ok(Self {
            manifest: records.into(),
            storage: InnerStorage::new(
                FSStorage::builder()
                    .fullpath("".into())
                    .subdir("".into())
                    .build(),
            ),
        })
    }

    /// A standalone-manifest collection: the catalog comes from a CSV
    /// manifest, the signatures from a storage root.
    pub fn from_manifest_and_dir<P: AsRef<Path>>(manifest_path: P, base: P) -> Result<Self> {
        let manifest = Manifest::from_path(manifest_path.as_ref().as_std_path())?;
        Ok(Self {
            manifest,
            storage: InnerStorage::new(FSStorage::new(base.as_ref().as_str(), "")),
        })
    }

    /// Append a signature, saving it into the backing storage.
    pub fn insert(&mut self, sig: Signature) -> Result<()> {
        let path = format!("signatures/{}.sig", sig.md5sum());
        let mut records = Record::from_sig(&sig, &path);
        let path = self.storage.save_sig(&path, sig)?;
        records.iter_mut().for_each(|rec| {
            rec.set_internal_location(path.clone().into());
        });

        let mut manifest = std::mem::take(&mut self.manifest);
        manifest += records.into();
        self.manifest = manifest;
        Ok(())
    }

    /// Write this collection as a zip archive with its manifest at the
    /// root. The archive appears atomically.
    pub fn to_zipfile<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(parent.as_std_path())?;

        {
            let mut zip = zip::ZipWriter::new(temp.as_file());
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);

            let mut manifest_bytes = vec![];
            self.manifest.to_writer(&mut manifest_bytes)?;
            zip.start_file("SOURMASH-MANIFEST.csv", options)?;
            zip.write_all(&manifest_bytes)?;

            for location in self.manifest.locations() {
                let data = self.storage.load(&location)?;
                zip.start_file(location, options)?;
                zip.write_all(&data)?;
            }

            zip.finish()?;
        }

        temp.persist(path.as_std_path())
            .map_err(|e| Error::from(std::io::Error::from(e.error)))?;
        Ok(())
    }

    pub fn record_for_dataset(&self, dataset_id: Idx) -> Result<&Record> {
        Ok(&self.manifest[dataset_id as usize])
    }

    /// Load the sketch for one manifest row, narrowed to exactly that
    /// row's parameters.
    pub fn sig_for_dataset(&self, dataset_id: Idx) -> Result<SigStore> {
        let match_path = if self.manifest.is_empty() {
            ""
        } else {
            self.manifest[dataset_id as usize]
                .internal_location()
                .as_str()
        };

        let selection = Selection::from_record(&self.manifest[dataset_id as usize])?;
        let sig = self.storage.load_sig(match_path)?;
        let name = sig.name();
        let sig: Signature = sig.into();
        let sig = sig.select(&selection)?;
        Ok(SigStore::from_sig(sig, name))
    }

    /// Iterate over all signatures, loading each from storage.
    pub fn sig_iter(&self) -> impl Iterator<Item = Result<SigStore>> + '_ {
        (0..self.manifest.len()).map(move |i| self.sig_for_dataset(i as Idx))
    }
}

impl Select for Collection {
    fn select(mut self, selection: &Selection) -> Result<Self> {
        self.manifest = self.manifest.select(selection)?;
        Ok(self)
    }
}

/// Write `sigs` into a fresh zip collection at `path`.
pub fn write_zip_collection<P: AsRef<Path>>(sigs: Vec<Signature>, path: P) -> Result<()> {
    let collection = Collection::from_sigs(sigs)?;
    collection.to_zipfile(path)
}
