//! SQLite-backed index and manifest.
//!
//! A `SqliteIndex` stores full scaled sketches as a reverse-indexed
//! collection of hashes; search runs off the reverse index. Num and
//! abundance sketches are not supported, and all sketches in one database
//! share a single scaled. Multiple moltype/ksize combinations are
//! permitted; the manifest's `select` narrows them.
//!
//! Hashes above `i64::MAX` are stored by reinterpreting the unsigned bit
//! pattern as a signed integer, and converted back on retrieval. Range
//! constraints in SQL have to account for this: `h <= max_hash` for a
//! `max_hash` within signed range becomes `h >= 0 AND h <= max_hash`, and
//! a larger `max_hash` admits every row.
//!
//! The index owns the only connection; the manifest is a selection-only
//! view that borrows it per call.

use std::collections::HashMap;

use camino::Utf8PathBuf as PathBuf;
use log::debug;
use rusqlite::{params, Connection};

use crate::collection::Collection;
use crate::encodings::HashFunctions;
use crate::index::linear::LinearIndex;
use crate::index::search::{prefetch_threshold_hashes, JaccardSearch};
use crate::index::{DbIndex, Index, IndexSearchResult, PrefetchResult};
use crate::manifest::{Manifest, Record};
use crate::selection::{Select, Selection};
use crate::signature::{Signature, SigsTrait};
use crate::sketch::minhash::KmerMinHash;
use crate::storage::FSStorage;
use crate::storage::InnerStorage;
use crate::{Error, Result};

pub const MAX_SQLITE_INT: u64 = i64::MAX as u64;

#[inline]
fn convert_hash_to(h: u64) -> i64 {
    h as i64
}

#[inline]
fn convert_hash_from(h: i64) -> u64 {
    h as u64
}

/// Read the `sourmash_internal` version table.
fn get_internal(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM sourmash_internal")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut internal = HashMap::new();
    for row in rows {
        let (k, v) = row?;
        internal.insert(k, v);
    }
    Ok(internal)
}

fn add_internal(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sourmash_internal (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

/// Selection state over the `sourmash_sketches` table. Carries no
/// connection of its own; every operation borrows the index's.
#[derive(Default, Clone)]
pub struct SqliteManifest {
    selection: Option<Selection>,
}

impl SqliteManifest {
    pub fn new(selection: Option<Selection>) -> Self {
        SqliteManifest { selection }
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// SQL conditions implied by the current selection. Picklists cannot
    /// be pushed down and are applied per row in `rows`.
    fn conditions(&self) -> (Vec<String>, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions: Vec<String> = vec![];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(selection) = &self.selection {
            if let Some(ksize) = selection.ksize() {
                conditions.push("ksize = ?".into());
                values.push(Box::new(ksize));
            }
            if let Some(moltype) = selection.moltype() {
                conditions.push("moltype = ?".into());
                values.push(Box::new(moltype.to_string()));
            }
            if selection.scaled().is_some() || selection.containment().unwrap_or(false) {
                conditions.push("scaled > 0".into());
            }
            if selection.num().is_some() {
                conditions.push("num > 0".into());
            }
            if let Some(abund) = selection.abund() {
                conditions.push("with_abundance = ?".into());
                values.push(Box::new(abund as i32));
            }
        }

        (conditions, values)
    }

    fn where_clause(conditions: &[String]) -> String {
        if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        }
    }

    /// All `(sketch_id, record)` pairs matching the current selection.
    pub fn rows(&self, conn: &Connection) -> Result<Vec<(i64, Record)>> {
        let (conditions, values) = self.conditions();
        let where_clause = Self::where_clause(&conditions);

        let sql = format!(
            "SELECT id, name, md5sum, num, scaled, ksize, filename, moltype, \
             seed, n_hashes, internal_location FROM sourmash_sketches {}",
            where_clause
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            let id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            let md5sum: String = row.get(2)?;
            let num: u32 = row.get(3)?;
            let scaled: i64 = row.get(4)?;
            let ksize: u32 = row.get(5)?;
            let filename: Option<String> = row.get(6)?;
            let moltype: String = row.get(7)?;
            let seed: i64 = row.get(8)?;
            let n_hashes: i64 = row.get(9)?;
            let internal_location: Option<String> = row.get(10)?;
            Ok((
                id,
                name,
                md5sum,
                num,
                scaled,
                ksize,
                filename,
                moltype,
                seed,
                n_hashes,
                internal_location,
            ))
        })?;

        let picklist = self
            .selection
            .as_ref()
            .and_then(|s| s.picklist().cloned());

        let mut records = vec![];
        for row in rows {
            let (id, name, md5sum, num, scaled, ksize, filename, moltype, seed, n_hashes, iloc) =
                row?;
            let record = Record::new(
                PathBuf::from(iloc.unwrap_or_default()),
                md5sum,
                ksize,
                moltype,
                num,
                scaled as u64,
                n_hashes as usize,
                seed as u64,
                false,
                name,
                filename.unwrap_or_default(),
            );
            if let Some(picklist) = &picklist {
                if !picklist.matches_manifest_row(&record) {
                    continue;
                }
            }
            records.push((id, record));
        }
        Ok(records)
    }

    /// Locations referenced by the selection. A superset when a picklist
    /// is set, since picklists are not pushed down.
    pub fn locations(&self, conn: &Connection) -> Result<Vec<String>> {
        let (conditions, values) = self.conditions();
        let where_clause = Self::where_clause(&conditions);

        let sql = format!(
            "SELECT DISTINCT internal_location FROM sourmash_sketches {}",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            row.get::<_, Option<String>>(0)
        })?;

        let mut locations = vec![];
        for row in rows {
            locations.push(row?.unwrap_or_default());
        }
        Ok(locations)
    }

    /// Export the current selection as an in-memory manifest.
    pub fn to_manifest(&self, conn: &Connection) -> Result<Manifest> {
        let records: Vec<Record> = self.rows(conn)?.into_iter().map(|(_, r)| r).collect();
        Ok(records.into())
    }

    /// Membership by md5, honoring any picklist.
    pub fn contains(&self, conn: &Connection, sig: &Signature) -> Result<bool> {
        let md5 = sig.md5sum();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sourmash_sketches WHERE md5sum = ?",
            params![md5],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Ok(false);
        }
        if let Some(picklist) = self.selection.as_ref().and_then(|s| s.picklist()) {
            return Ok(picklist.matches_md5(&md5));
        }
        Ok(true)
    }

    fn insert_row(&self, conn: &Connection, record: &Record) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO sourmash_sketches \
             (name, num, scaled, ksize, filename, md5sum, moltype, \
              seed, n_hashes, with_abundance, internal_location) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.name(),
                record.num(),
                record.scaled() as i64,
                record.ksize(),
                record.filename(),
                record.md5(),
                record.moltype().to_string(),
                record.seed() as i64,
                record.n_hashes() as i64,
                record.with_abundance() as i32,
                record.internal_location().as_str(),
            ],
        )?;
        Ok(())
    }
}

/// Merge two selections, erroring when they constrain the same field
/// differently.
fn merge_selections(old: Option<&Selection>, new: &Selection) -> Result<Selection> {
    let mut merged = match old {
        Some(old) => old.clone(),
        None => return Ok(new.clone()),
    };

    macro_rules! merge_field {
        ($get:ident, $set:ident) => {
            if let Some(value) = new.$get() {
                match merged.$get() {
                    Some(existing) if existing != value => {
                        return Err(Error::Internal {
                            message: format!("incompatible select on '{}'", stringify!($get)),
                        })
                    }
                    _ => merged.$set(value),
                }
            }
        };
    }

    merge_field!(ksize, set_ksize);
    merge_field!(abund, set_abund);
    merge_field!(num, set_num);
    merge_field!(scaled, set_scaled);
    merge_field!(containment, set_containment);
    merge_field!(moltype, set_moltype);

    if let Some(picklist) = new.picklist() {
        merged.set_picklist(picklist.clone());
    }

    Ok(merged)
}

/// A reverse-indexed, SQLite-backed collection of scaled sketches.
pub struct SqliteIndex {
    dbfile: PathBuf,
    conn: Connection,
    manifest: SqliteManifest,
    scaled: Option<u64>,
}

impl SqliteIndex {
    fn open_conn(dbfile: &PathBuf) -> Result<Connection> {
        let conn = Connection::open(dbfile.as_std_path())?;

        conn.execute_batch(
            "PRAGMA cache_size=10000000;\n\
             PRAGMA synchronous = OFF;\n\
             PRAGMA temp_store = MEMORY;",
        )?;
        // journal_mode reports the new mode back as a row
        conn.query_row("PRAGMA journal_mode = MEMORY", [], |_| Ok(()))?;

        Ok(conn)
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sourmash_internal (
               key TEXT UNIQUE NOT NULL,
               value TEXT
             );
             CREATE TABLE IF NOT EXISTS sourmash_sketches
               (id INTEGER PRIMARY KEY,
                name TEXT,
                num INTEGER NOT NULL,
                scaled INTEGER NOT NULL,
                ksize INTEGER NOT NULL,
                filename TEXT,
                moltype TEXT NOT NULL,
                with_abundance BOOLEAN NOT NULL,
                md5sum TEXT NOT NULL,
                seed INTEGER NOT NULL,
                n_hashes INTEGER NOT NULL,
                internal_location TEXT,
             UNIQUE(internal_location, md5sum)
             );
             CREATE TABLE IF NOT EXISTS sourmash_hashes (
               hashval INTEGER NOT NULL,
               sketch_id INTEGER NOT NULL,
               FOREIGN KEY (sketch_id) REFERENCES sourmash_sketches (id)
             );
             CREATE INDEX IF NOT EXISTS sourmash_hashval_idx ON sourmash_hashes (
               hashval,
               sketch_id
             );
             CREATE INDEX IF NOT EXISTS sourmash_hashval_idx2 ON sourmash_hashes (
               hashval
             );
             CREATE INDEX IF NOT EXISTS sourmash_sketch_idx ON sourmash_hashes (
               sketch_id
             );",
        )?;

        add_internal(conn, "SqliteIndex", "1.0")?;
        add_internal(conn, "SqliteManifest", "1.0")?;
        Ok(())
    }

    /// Create a new index (or append to an existing one).
    pub fn create<P: Into<PathBuf>>(dbfile: P) -> Result<Self> {
        let dbfile = dbfile.into();
        let conn = Self::open_conn(&dbfile)?;
        Self::create_tables(&conn)?;
        Self::from_conn(conn, dbfile, None)
    }

    /// Open an existing index, probing the schema version.
    pub fn open<P: Into<PathBuf>>(dbfile: P) -> Result<Self> {
        let dbfile = dbfile.into();
        let conn = Self::open_conn(&dbfile)?;

        let internal = get_internal(&conn).map_err(|_| Error::IndexNotSupported {
            message: format!("no version table in '{}'", dbfile),
        })?;

        match internal.get("SqliteIndex").map(|v| v.as_str()) {
            Some("1.0") => {}
            Some(other) => {
                return Err(Error::IndexNotSupported {
                    message: format!("SqliteIndex version {} not supported", other),
                })
            }
            None => {
                return Err(Error::IndexNotSupported {
                    message: format!("'{}' is not a SqliteIndex", dbfile),
                })
            }
        }

        Self::from_conn(conn, dbfile, None)
    }

    fn from_conn(conn: Connection, dbfile: PathBuf, selection: Option<Selection>) -> Result<Self> {
        // all sketches in one database share a single scaled
        let mut scaled_vals = vec![];
        {
            let mut stmt = conn.prepare("SELECT DISTINCT scaled FROM sourmash_sketches")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            for row in rows {
                scaled_vals.push(row? as u64);
            }
        }

        if scaled_vals.len() > 1 {
            return Err(Error::SqliteIndexRestriction {
                message: "multiple scaled values".into(),
            });
        }

        Ok(SqliteIndex {
            dbfile,
            conn,
            manifest: SqliteManifest::new(selection),
            scaled: scaled_vals.first().copied(),
        })
    }

    pub fn dbfile(&self) -> &PathBuf {
        &self.dbfile
    }

    pub fn scaled(&self) -> Option<u64> {
        self.scaled
    }

    pub fn manifest(&self) -> &SqliteManifest {
        &self.manifest
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Close the underlying connection, reporting any final error.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e.into())
    }

    /// Insert a signature. Only flat scaled sketches are accepted, and
    /// every sketch must match the database's scaled.
    pub fn insert(&mut self, sig: &Signature) -> Result<()> {
        let mh = sig
            .minhash()
            .ok_or(Error::EmptySelection)?;

        if mh.num() != 0 {
            return Err(Error::SqliteIndexRestriction {
                message: "'num' sketches".into(),
            });
        }
        if mh.track_abundance() {
            return Err(Error::SqliteIndexRestriction {
                message: "sketches with abundance".into(),
            });
        }

        match self.scaled {
            Some(scaled) if scaled != mh.scaled() => {
                return Err(Error::SqliteIndexRestriction {
                    message: format!("sketches with scaled != {}", scaled),
                });
            }
            None => self.scaled = Some(mh.scaled()),
            _ => {}
        }

        let record = Record::from_sig(sig, self.dbfile.as_str())
            .into_iter()
            .next()
            .ok_or(Error::EmptySelection)?;

        let tx = self.conn.transaction()?;
        self.manifest.insert_row(&tx, &record)?;
        let sketch_id = tx.last_insert_rowid();

        {
            let mut stmt =
                tx.prepare("INSERT INTO sourmash_hashes (hashval, sketch_id) VALUES (?, ?)")?;
            for hash in mh.iter_mins() {
                stmt.execute(params![convert_hash_to(*hash), sketch_id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Open an index together with its embedded lineage database. The
    /// lineage-enriched form requires a single ksize/moltype combination.
    pub fn open_with_lineage<P: Into<PathBuf>>(
        dbfile: P,
    ) -> Result<(Self, crate::tax::LineageDb)> {
        let index = Self::open(dbfile)?;

        let mut combos = vec![];
        {
            let mut stmt = index
                .conn
                .prepare("SELECT DISTINCT ksize, moltype FROM sourmash_sketches")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                combos.push(row?);
            }
        }

        if combos.len() != 1 {
            return Err(Error::SqliteIndexRestriction {
                message: "multiple ksize/moltype combinations in a lineage database".into(),
            });
        }

        let lineage_db = crate::tax::LineageDb::from_conn(&index.conn)?;
        Ok((index, lineage_db))
    }

    /// Sketch ids associated with a hash value, for taxonomic assignment.
    pub fn hashval_to_idx(&self, hashval: u64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sketch_id FROM sourmash_hashes WHERE hashval = ?")?;
        let rows = stmt.query_map(params![convert_hash_to(hashval)], |row| {
            row.get::<_, i64>(0)
        })?;

        let mut idxs = vec![];
        for row in rows {
            idxs.push(row?);
        }
        Ok(idxs)
    }

    /// Size of a stored sketch, downsampled by `max_hash`.
    fn load_sketch_size(&self, sketch_id: i64, max_hash: u64) -> Result<usize> {
        let count: i64 = if max_hash <= MAX_SQLITE_INT {
            self.conn.query_row(
                "SELECT COUNT(hashval) FROM sourmash_hashes \
                 WHERE sketch_id = ? AND hashval >= 0 AND hashval <= ?",
                params![sketch_id, max_hash as i64],
                |row| row.get(0),
            )?
        } else {
            self.conn.query_row(
                "SELECT COUNT(hashval) FROM sourmash_hashes WHERE sketch_id = ?",
                params![sketch_id],
                |row| row.get(0),
            )?
        };
        Ok(count as usize)
    }

    /// Reconstruct one stored sketch as a signature.
    fn load_sketch(&self, sketch_id: i64, record: &Record) -> Result<Signature> {
        let moltype = record.moltype();
        let ksize = if moltype.dna() {
            record.ksize()
        } else {
            record.ksize() * 3
        };

        let mut mh = KmerMinHash::new(
            record.scaled(),
            ksize,
            moltype,
            record.seed(),
            false,
            0,
        );

        let mut stmt = self
            .conn
            .prepare("SELECT hashval FROM sourmash_hashes WHERE sketch_id = ?")?;
        let rows = stmt.query_map(params![sketch_id], |row| row.get::<_, i64>(0))?;
        for row in rows {
            mh.add_hash(convert_hash_from(row?));
        }

        let mut sig = Signature::default();
        sig.set_name(record.name());
        sig.set_filename(record.filename());
        sig.push(mh);
        Ok(sig)
    }

    /// For the query's hashes, retrieve all matching sketches together
    /// with the number of overlapping hashes, biggest overlap first.
    fn matching_sketches(&self, hashes: &[u64], max_hash: u64) -> Result<Vec<(i64, u64)>> {
        let c = &self.conn;
        c.execute("DROP TABLE IF EXISTS sourmash_hash_query", [])?;
        c.execute(
            "CREATE TEMPORARY TABLE sourmash_hash_query (hashval INTEGER PRIMARY KEY)",
            [],
        )?;

        {
            let mut stmt =
                c.prepare("INSERT OR IGNORE INTO sourmash_hash_query (hashval) VALUES (?)")?;
            for hash in hashes {
                stmt.execute(params![convert_hash_to(*hash)])?;
            }
        }

        let max_hash = u64::min(max_hash, hashes.iter().copied().max().unwrap_or(max_hash));

        let mut conditions = vec![];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if max_hash <= MAX_SQLITE_INT {
            conditions
                .push("sourmash_hashes.hashval >= 0 AND sourmash_hashes.hashval <= ?".to_string());
            values.push(Box::new(max_hash as i64));
        }
        conditions.push("sourmash_hashes.hashval = sourmash_hash_query.hashval".to_string());

        let sql = format!(
            "SELECT DISTINCT sourmash_hashes.sketch_id, \
             COUNT(sourmash_hashes.hashval) AS CNT \
             FROM sourmash_hashes, sourmash_hash_query \
             WHERE {} \
             GROUP BY sourmash_hashes.sketch_id ORDER BY CNT DESC",
            conditions.join(" AND ")
        );

        let mut stmt = c.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut matches = vec![];
        for row in rows {
            let (sketch_id, count) = row?;
            matches.push((sketch_id, count as u64));
        }

        debug!("matching sketches for query: {}", matches.len());
        Ok(matches)
    }

    /// Downsample the query to the database's scaled, when coarser.
    fn prepare_query(&self, query: &KmerMinHash) -> Result<KmerMinHash> {
        if query.max_hash() == 0 {
            return Err(Error::NeedsScaled {
                message: "SqliteIndex queries".into(),
            });
        }
        match self.scaled {
            Some(scaled) if scaled > query.scaled() => query.downsample_scaled(scaled),
            _ => Ok(query.clone()),
        }
    }
}

impl Index for SqliteIndex {
    fn len(&self) -> usize {
        self.manifest.rows(&self.conn).map(|r| r.len()).unwrap_or(0)
    }

    fn location(&self) -> Option<String> {
        Some(self.dbfile.to_string())
    }

    fn signatures(&self) -> Result<Vec<Signature>> {
        Ok(self
            .signatures_with_location()?
            .into_iter()
            .map(|(sig, _)| sig)
            .collect())
    }

    fn signatures_with_location(&self) -> Result<Vec<(Signature, String)>> {
        let mut sigs = vec![];
        for (sketch_id, record) in self.manifest.rows(&self.conn)? {
            let sig = self.load_sketch(sketch_id, &record)?;
            sigs.push((sig, self.dbfile.to_string()));
        }
        Ok(sigs)
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

        let query_mh = self.prepare_query(query)?;
        let query_size = query_mh.size();
        let max_hash = query_mh.max_hash();

        let selected: HashMap<i64, Record> =
            self.manifest.rows(&self.conn)?.into_iter().collect();

        let mut results = vec![];
        for (sketch_id, shared) in self.matching_sketches(&query_mh.mins(), max_hash)? {
            let record = match selected.get(&sketch_id) {
                Some(record) => record,
                None => continue,
            };

            // estimate sizes from SQL before loading the whole sketch
            let subj_size = self.load_sketch_size(sketch_id, max_hash)?;
            let total_size = query_size + subj_size - shared as usize;

            let score = search_fn.score(query_size, shared as usize, subj_size, total_size);
            if search_fn.passes(score) {
                search_fn.collect(score);
                let subj = self.load_sketch(sketch_id, record)?;
                results.push(IndexSearchResult {
                    score,
                    signature: subj,
                    location: self.dbfile.to_string(),
                });
            }
        }

        Ok(results)
    }

    fn prefetch(&self, query: &KmerMinHash, threshold_bp: u64) -> Result<Vec<PrefetchResult>> {
        if query.is_empty() {
            return Ok(vec![]);
        }

        let query_mh = self.prepare_query(query)?;
        let threshold_hashes = prefetch_threshold_hashes(threshold_bp, query_mh.scaled());

        let selected: HashMap<i64, Record> =
            self.manifest.rows(&self.conn)?.into_iter().collect();

        let mut results = vec![];
        for (sketch_id, overlap) in
            self.matching_sketches(&query_mh.mins(), query_mh.max_hash())?
        {
            if overlap == 0 || overlap < threshold_hashes {
                continue;
            }
            let record = match selected.get(&sketch_id) {
                Some(record) => record,
                None => continue,
            };

            let sig = self.load_sketch(sketch_id, record)?;
            let mh = sig.minhash().expect("stored sketches are single").clone();
            results.push(PrefetchResult {
                name: sig.name(),
                md5: record.md5().clone(),
                location: self.dbfile.to_string(),
                minhash: mh,
                signature: sig,
                overlap,
            });
        }

        Ok(results)
    }
}

impl Select for SqliteIndex {
    fn select(self, selection: &Selection) -> Result<Self> {
        if selection.num().is_some() {
            return Err(Error::SqliteIndexRestriction {
                message: "a 'num' selection".into(),
            });
        }
        if selection.abund() == Some(true) {
            return Err(Error::SqliteIndexRestriction {
                message: "an abundance selection".into(),
            });
        }

        let merged = merge_selections(self.manifest.selection(), selection)?;

        Ok(SqliteIndex {
            dbfile: self.dbfile,
            conn: self.conn,
            manifest: SqliteManifest::new(Some(merged)),
            scaled: self.scaled,
        })
    }
}

/// Store an in-memory manifest as a standalone SQLite manifest.
pub fn save_sqlite_manifest<P: Into<PathBuf>>(path: P, manifest: &Manifest) -> Result<()> {
    let path = path.into();
    let conn = Connection::open(path.as_std_path())?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sourmash_internal (
           key TEXT UNIQUE NOT NULL,
           value TEXT
         );
         CREATE TABLE IF NOT EXISTS sourmash_sketches
           (id INTEGER PRIMARY KEY,
            name TEXT,
            num INTEGER NOT NULL,
            scaled INTEGER NOT NULL,
            ksize INTEGER NOT NULL,
            filename TEXT,
            moltype TEXT NOT NULL,
            with_abundance BOOLEAN NOT NULL,
            md5sum TEXT NOT NULL,
            seed INTEGER NOT NULL,
            n_hashes INTEGER NOT NULL,
            internal_location TEXT,
         UNIQUE(internal_location, md5sum)
         );",
    )?;
    add_internal(&conn, "SqliteManifest", "1.0")?;

    let mf = SqliteManifest::default();
    for record in manifest.iter() {
        mf.insert_row(&conn, record)?;
    }
    Ok(())
}

/// Load a standalone SQLite manifest into memory.
pub fn load_sqlite_manifest<P: Into<PathBuf>>(path: P) -> Result<Manifest> {
    let path = path.into();
    let conn = Connection::open(path.as_std_path())?;

    let internal = get_internal(&conn).map_err(|_| Error::IndexNotSupported {
        message: format!("no version table in '{}'", path),
    })?;
    match internal.get("SqliteManifest").map(|v| v.as_str()) {
        Some("1.0") => {}
        Some(other) => {
            return Err(Error::IndexNotSupported {
                message: format!("SqliteManifest version {} not supported", other),
            })
        }
        None => {
            return Err(Error::IndexNotSupported {
                message: format!("'{}' is not a SqliteManifest", path),
            })
        }
    }

    SqliteManifest::default().to_manifest(&conn)
}

/// Top-level loader: dispatch a SQLite file to the right index flavor by
/// its internal version tags.
pub fn load_sqlite_index<P: Into<PathBuf>>(path: P) -> Result<DbIndex> {
    let path = path.into();
    let conn = Connection::open(path.as_std_path())?;
    let internal = get_internal(&conn).map_err(|_| Error::IndexNotSupported {
        message: format!("no version table in '{}'", path),
    })?;
    drop(conn);

    if internal.contains_key("SqliteIndex") {
        return Ok(DbIndex::Sqlite(SqliteIndex::open(path)?));
    }

    if internal.contains_key("SqliteManifest") {
        // standalone manifest: signatures live next to the manifest file
        let manifest = load_sqlite_manifest(path.clone())?;
        let prefix = path.parent().map(|p| p.to_string()).unwrap_or_default();
        let collection = Collection::new(
            manifest,
            InnerStorage::new(FSStorage::new(&prefix, "")),
        );
        return Ok(DbIndex::Linear(LinearIndex::from_collection(
            collection.try_into()?,
        )));
    }

    Err(Error::IndexNotSupported {
        message: format!("no known schema tags in '{}'", path),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::search::SearchType;
    use tempfile::TempDir;

    fn sig_from_hashes(name: &str, hashes: &[u64], scaled: u64) -> Signature {
        let mut mh = KmerMinHash::new(scaled, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        mh.add_many(hashes).unwrap();
        let mut sig = Signature::default();
        sig.set_name(name);
        sig.push(mh);
        sig
    }

    fn build_index(dir: &TempDir) -> PathBuf {
        let dbfile = PathBuf::from_path_buf(dir.path().join("index.sqldb")).unwrap();
        let mut index = SqliteIndex::create(dbfile.clone()).unwrap();

        index
            .insert(&sig_from_hashes("one", &[1, 2, 3, 4, 5], 1))
            .unwrap();
        index
            .insert(&sig_from_hashes("two", &[1, 2, 3, 40, 50], 1))
            .unwrap();
        index
            .insert(&sig_from_hashes("three", &[100, 200, 300], 1))
            .unwrap();

        dbfile
    }

    #[test]
    fn sqlite_roundtrip_search() {
        let dir = TempDir::new().unwrap();
        let dbfile = build_index(&dir);

        // reopen in a fresh session
        let index = SqliteIndex::open(dbfile).unwrap();
        assert_eq!(index.len(), 3);

        let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query.add_many(&[1, 2, 3, 4, 5]).unwrap();

        let mut search_fn = JaccardSearch::new(SearchType::Jaccard, 1.0);
        let results = index.search(&mut search_fn, &query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].signature.name(), "one");
        assert_eq!(results[0].score, 1.0);

        let mut search_fn = JaccardSearch::new(SearchType::Containment, 0.0);
        let results = index.search(&mut search_fn, &query).unwrap();
        assert_eq!(results.len(), 2);

        // a query overlapping all three
        let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query.add_many(&[1, 2, 3, 40, 50, 100, 200, 300]).unwrap();
        let mut search_fn = JaccardSearch::new(SearchType::Containment, 0.0);
        let results = index.search(&mut search_fn, &query).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn sqlite_rejects_num_and_abundance() {
        let dir = TempDir::new().unwrap();
        let dbfile = PathBuf::from_path_buf(dir.path().join("index.sqldb")).unwrap();
        let mut index = SqliteIndex::create(dbfile).unwrap();

        let mut num_mh = KmerMinHash::new(0, 31, HashFunctions::Murmur64Dna, 42, false, 100);
        num_mh.add_many(&[1, 2, 3]).unwrap();
        let mut num_sig = Signature::default();
        num_sig.push(num_mh);
        assert!(matches!(
            index.insert(&num_sig),
            Err(Error::SqliteIndexRestriction { .. })
        ));

        let mut abund_mh = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, true, 0);
        abund_mh.set_abundances(&[(1, 2)], false).unwrap();
        let mut abund_sig = Signature::default();
        abund_sig.push(abund_mh);
        assert!(matches!(
            index.insert(&abund_sig),
            Err(Error::SqliteIndexRestriction { .. })
        ));
    }

    #[test]
    fn sqlite_rejects_mixed_scaled() {
        let dir = TempDir::new().unwrap();
        let dbfile = PathBuf::from_path_buf(dir.path().join("index.sqldb")).unwrap();
        let mut index = SqliteIndex::create(dbfile).unwrap();

        index
            .insert(&sig_from_hashes("a", &[1, 2, 3], 1))
            .unwrap();
        assert!(matches!(
            index.insert(&sig_from_hashes("b", &[1, 2, 3], 1000)),
            Err(Error::SqliteIndexRestriction { .. })
        ));
    }

    #[test]
    fn sqlite_version_probe() {
        let dir = TempDir::new().unwrap();
        let other = PathBuf::from_path_buf(dir.path().join("other.sqldb")).unwrap();

        // a database with no version table at all
        let conn = Connection::open(other.as_std_path()).unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        drop(conn);

        assert!(matches!(
            SqliteIndex::open(other.clone()),
            Err(Error::IndexNotSupported { .. })
        ));
        assert!(matches!(
            load_sqlite_index(other),
            Err(Error::IndexNotSupported { .. })
        ));
    }

    #[test]
    fn sqlite_gather() {
        let dir = TempDir::new().unwrap();
        let dbfile = build_index(&dir);
        let index = SqliteIndex::open(dbfile).unwrap();

        let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query.add_many(&[1, 2, 3, 4, 5, 40, 100, 200]).unwrap();

        let results = index.gather(&query, 0).unwrap();
        assert_eq!(results.len(), 3);
        // "one" claims 1..=5, "three" claims 100 and 200, "two" is left
        // with just 40
        assert_eq!(results[0].name(), "one");
        assert_eq!(results[1].name(), "three");
        assert_eq!(results[2].name(), "two");
        assert_eq!(results[0].f_unique_to_query(), 5.0 / 8.0);
        assert_eq!(results[1].f_unique_to_query(), 2.0 / 8.0);
        assert_eq!(results[2].f_unique_to_query(), 1.0 / 8.0);
    }

    #[test]
    fn sqlite_select_merges() {
        let dir = TempDir::new().unwrap();
        let dbfile = build_index(&dir);
        let index = SqliteIndex::open(dbfile).unwrap();

        let mut selection = Selection::default();
        selection.set_ksize(31);
        let index = index.select(&selection).unwrap();
        assert_eq!(index.len(), 3);

        let mut conflicting = Selection::default();
        conflicting.set_ksize(21);
        assert!(index.select(&conflicting).is_err());
    }

    #[test]
    fn sqlite_select_ksize_narrows() {
        let dir = TempDir::new().unwrap();
        let dbfile = build_index(&dir);
        let index = SqliteIndex::open(dbfile).unwrap();

        let mut selection = Selection::default();
        selection.set_ksize(21);
        let narrowed = index.select(&selection).unwrap();
        assert_eq!(narrowed.len(), 0);

        let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query.add_many(&[1, 2, 3, 4, 5]).unwrap();
        let mut search_fn = JaccardSearch::new(SearchType::Containment, 0.0);
        assert!(narrowed.search(&mut search_fn, &query).unwrap().is_empty());
    }

    #[test]
    fn sqlite_high_bit_hashes() {
        let dir = TempDir::new().unwrap();
        let dbfile = PathBuf::from_path_buf(dir.path().join("index.sqldb")).unwrap();
        let mut index = SqliteIndex::create(dbfile.clone()).unwrap();

        // values above 2^63 - 1 become negative in storage and must
        // round-trip
        let high = &[u64::MAX - 5, u64::MAX - 2, 17];
        index.insert(&sig_from_hashes("high", high, 1)).unwrap();
        drop(index);

        let index = SqliteIndex::open(dbfile).unwrap();
        let sigs = index.signatures().unwrap();
        assert_eq!(sigs.len(), 1);
        let mut mins = sigs[0].minhash().unwrap().mins();
        mins.sort_unstable();
        assert_eq!(mins, vec![17, u64::MAX - 5, u64::MAX - 2]);

        let mut query = KmerMinHash::new(1, 31, HashFunctions::Murmur64Dna, 42, false, 0);
        query.add_many(high).unwrap();
        let mut search_fn = JaccardSearch::new(SearchType::Jaccard, 1.0);
        let results = index.search(&mut search_fn, &query).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn sqlite_hashval_to_idx() {
        let dir = TempDir::new().unwrap();
        let dbfile = build_index(&dir);
        let index = SqliteIndex::open(dbfile).unwrap();

        let idxs = index.hashval_to_idx(1).unwrap();
        assert_eq!(idxs.len(), 2);
        let idxs = index.hashval_to_idx(100).unwrap();
        assert_eq!(idxs.len(), 1);
        let idxs = index.hashval_to_idx(9999).unwrap();
        assert!(idxs.is_empty());
    }

    #[test]
    fn sqlite_index_with_lineage() {
        use crate::tax::{LineageDb, LineagePair};

        let dir = TempDir::new().unwrap();
        let dbfile = build_index(&dir);

        // attach a lineage table to the same database file
        {
            let conn = Connection::open(dbfile.as_std_path()).unwrap();
            let mut tax = LineageDb::new();
            tax.insert(
                "one",
                vec![LineagePair {
                    rank: "superkingdom".into(),
                    name: "Bacteria".into(),
                }],
            );
            tax.save_conn(&conn).unwrap();
        }

        let (index, lineage_db) = SqliteIndex::open_with_lineage(dbfile).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(lineage_db.len(), 1);
        assert!(lineage_db.lookup("one genome description").is_some());
    }

    #[test]
    fn sqlite_standalone_manifest() {
        let dir = TempDir::new().unwrap();
        let mf_path = PathBuf::from_path_buf(dir.path().join("manifest.sqlmf")).unwrap();

        let sig = sig_from_hashes("standalone", &[1, 2, 3], 1);
        let manifest: Manifest = Record::from_sig(&sig, "standalone.sig").into();
        save_sqlite_manifest(mf_path.clone(), &manifest).unwrap();

        let loaded = load_sqlite_manifest(mf_path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.iter().next().unwrap().name(), "standalone");
    }
}
