//! Lineage databases and taxonomic summarization of gather output.
//!
//! A lineage maps an identifier (the first token of a signature name) to
//! an ordered list of `(rank, name)` pairs over the standard eight ranks.
//! Gather results are aggregated up each rank by summing the fractions of
//! the query their matches claimed.

use std::collections::HashMap;
use std::io::Read;

use camino::Utf8PathBuf as PathBuf;
use log::warn;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::index::GatherResult;
use crate::{Error, Result};

pub const RANKS: [&str; 8] = [
    "superkingdom",
    "phylum",
    "class",
    "order",
    "family",
    "genus",
    "species",
    "strain",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineagePair {
    pub rank: String,
    pub name: String,
}

pub type Lineage = Vec<LineagePair>;

/// Truncate a lineage at `rank` (inclusive). `None` when the lineage does
/// not reach that rank.
pub fn pop_to_rank(lineage: &Lineage, rank: &str) -> Option<Lineage> {
    let pos = lineage.iter().position(|pair| pair.rank == rank)?;
    let truncated: Lineage = lineage[..=pos].to_vec();
    if truncated.last().map(|p| p.name.as_str()) == Some("") {
        return None;
    }
    Some(truncated)
}

/// Render a lineage as `name;name;...`.
pub fn display_lineage(lineage: &Lineage) -> String {
    lineage
        .iter()
        .map(|pair| pair.name.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

/// What to do when a gather match has no lineage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentPolicy {
    /// Skip the match and log a warning.
    #[default]
    SkipWithWarning,
    /// Abort the summarization.
    Fail,
    /// Skip the match silently.
    Silent,
}

/// Identifier -> lineage mapping, loadable from CSV or SQLite.
#[derive(Debug, Default, Clone)]
pub struct LineageDb {
    idents: HashMap<String, Lineage>,
}

impl LineageDb {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, ident: &str, lineage: Lineage) {
        self.idents.insert(ident.into(), lineage);
    }

    pub fn len(&self) -> usize {
        self.idents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idents.is_empty()
    }

    pub fn get(&self, ident: &str) -> Option<&Lineage> {
        self.idents.get(ident)
    }

    /// Resolve a signature name: try the first token as-is, then with any
    /// trailing `.version` stripped.
    pub fn lookup(&self, name: &str) -> Option<&Lineage> {
        let ident = name.split_whitespace().next()?;
        if let Some(lineage) = self.idents.get(ident) {
            return Some(lineage);
        }

        let bare = ident.split('.').next()?;
        self.idents.get(bare)
    }

    /// Load from a CSV with an `ident` column plus one column per rank.
    pub fn from_csv<R: Read>(rdr: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_reader(rdr);

        let headers = reader.headers()?.clone();
        let ident_idx = headers
            .iter()
            .position(|h| h == "ident" || h == "name")
            .ok_or_else(|| Error::Internal {
                message: "taxonomy CSV needs an 'ident' column".into(),
            })?;

        let rank_cols: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| RANKS.contains(h))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        if rank_cols.is_empty() {
            return Err(Error::Internal {
                message: "taxonomy CSV has no rank columns".into(),
            });
        }

        let mut db = LineageDb::new();
        for row in reader.records() {
            let row = row?;
            let ident = match row.get(ident_idx) {
                Some(i) if !i.is_empty() => i.to_string(),
                _ => continue,
            };

            let lineage: Lineage = rank_cols
                .iter()
                .filter_map(|(i, rank)| {
                    row.get(*i).map(|name| LineagePair {
                        rank: rank.clone(),
                        name: name.to_string(),
                    })
                })
                .collect();

            db.insert(&ident, lineage);
        }

        Ok(db)
    }

    /// Load from the `sourmash_taxonomy` table of a SQLite database.
    pub fn from_sqlite<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(path.as_std_path())?;
        Self::from_conn(&conn).map_err(|e| e.while_loading(path.as_str()))
    }

    pub fn from_conn(conn: &Connection) -> Result<Self> {
        let internal: std::result::Result<String, _> = conn.query_row(
            "SELECT value FROM sourmash_internal WHERE key = 'SqliteLineage'",
            [],
            |row| row.get(0),
        );
        match internal {
            Ok(v) if v == "1.0" => {}
            Ok(v) => {
                return Err(Error::IndexNotSupported {
                    message: format!("SqliteLineage version {} not supported", v),
                })
            }
            Err(_) => {
                return Err(Error::IndexNotSupported {
                    message: "no SqliteLineage tag".into(),
                })
            }
        }

        let columns = RANKS
            .iter()
            .map(|r| format!("\"{}\"", r))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT ident, {} FROM sourmash_taxonomy", columns);

        let mut db = LineageDb::new();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let ident: String = row.get(0)?;
            let mut names = vec![];
            for i in 0..RANKS.len() {
                names.push(row.get::<_, Option<String>>(i + 1)?.unwrap_or_default());
            }
            Ok((ident, names))
        })?;

        for row in rows {
            let (ident, names) = row?;
            let lineage: Lineage = RANKS
                .iter()
                .zip(names)
                .map(|(rank, name)| LineagePair {
                    rank: rank.to_string(),
                    name,
                })
                .collect();
            db.insert(&ident, lineage);
        }

        Ok(db)
    }

    /// Write into a SQLite database, tagging it `SqliteLineage=1.0`. Can
    /// share a connection with a `SqliteIndex`.
    pub fn save_conn(&self, conn: &Connection) -> Result<()> {
        let columns = RANKS
            .iter()
            .map(|r| format!("\"{}\" TEXT", r))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS sourmash_internal (
               key TEXT UNIQUE NOT NULL,
               value TEXT
             );
             CREATE TABLE IF NOT EXISTS sourmash_taxonomy (
               ident TEXT NOT NULL UNIQUE,
               {}
             );",
            columns
        ))?;
        conn.execute(
            "INSERT OR IGNORE INTO sourmash_internal (key, value) VALUES ('SqliteLineage', '1.0')",
            [],
        )?;

        let placeholders = (0..RANKS.len() + 1)
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let columns = RANKS
            .iter()
            .map(|r| format!("\"{}\"", r))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO sourmash_taxonomy (ident, {}) VALUES ({})",
            columns, placeholders
        );

        let mut stmt = conn.prepare(&sql)?;
        for (ident, lineage) in &self.idents {
            let mut values: Vec<String> = vec![ident.clone()];
            for rank in RANKS.iter() {
                let name = lineage
                    .iter()
                    .find(|pair| &pair.rank == rank)
                    .map(|pair| pair.name.clone())
                    .unwrap_or_default();
                values.push(name);
            }
            stmt.execute(rusqlite::params_from_iter(values.iter()))?;
        }

        Ok(())
    }
}

/// One aggregated row of a taxonomic summary.
#[derive(Debug, Clone, Serialize)]
pub struct SummarizedGatherResult {
    pub rank: String,
    pub lineage: Lineage,
    /// summed `f_unique_to_query` of matches under this lineage
    pub fraction: f64,
    /// summed `f_unique_weighted`
    pub f_weighted_at_rank: f64,
    /// summed unique overlap, in bp
    pub bp_match_at_rank: usize,
}

/// Aggregate gather results at one rank of the taxonomy.
///
/// Matches without a lineage entry are handled per `policy`; matches whose
/// lineage does not reach `rank` are skipped.
pub fn summarize_gather_at(
    rank: &str,
    db: &LineageDb,
    gather_results: &[GatherResult],
    policy: IdentPolicy,
) -> Result<Vec<SummarizedGatherResult>> {
    if !RANKS.contains(&rank) {
        return Err(Error::Internal {
            message: format!("unknown rank: {}", rank),
        });
    }

    let mut by_lineage: HashMap<Lineage, (f64, f64, usize)> = HashMap::new();

    for result in gather_results {
        let lineage = match db.lookup(result.name()) {
            Some(lineage) => lineage,
            None => match policy {
                IdentPolicy::Fail => {
                    return Err(Error::MissingIdentifier {
                        ident: result.name().clone(),
                    })
                }
                IdentPolicy::SkipWithWarning => {
                    warn!("no lineage for '{}'; skipping", result.name());
                    continue;
                }
                IdentPolicy::Silent => continue,
            },
        };

        let truncated = match pop_to_rank(lineage, rank) {
            Some(truncated) => truncated,
            None => continue,
        };

        let entry = by_lineage.entry(truncated).or_insert((0.0, 0.0, 0));
        entry.0 += result.f_unique_to_query();
        entry.1 += result.f_unique_weighted();
        entry.2 += result.unique_intersect_bp();
    }

    let mut summarized: Vec<SummarizedGatherResult> = by_lineage
        .into_iter()
        .map(
            |(lineage, (fraction, f_weighted, bp))| SummarizedGatherResult {
                rank: rank.into(),
                lineage,
                fraction,
                f_weighted_at_rank: f_weighted,
                bp_match_at_rank: bp,
            },
        )
        .collect();

    summarized.sort_by(|a, b| {
        b.fraction
            .partial_cmp(&a.fraction)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| display_lineage(&a.lineage).cmp(&display_lineage(&b.lineage)))
    });

    Ok(summarized)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::GatherResult;

    fn lineage(names: &[&str]) -> Lineage {
        RANKS
            .iter()
            .zip(names.iter())
            .map(|(rank, name)| LineagePair {
                rank: rank.to_string(),
                name: name.to_string(),
            })
            .collect()
    }

    fn test_db() -> LineageDb {
        let mut db = LineageDb::new();
        db.insert(
            "GCF_001",
            lineage(&["Bacteria", "Proteobacteria", "Gammaproteobacteria"]),
        );
        db.insert(
            "GCF_002",
            lineage(&["Bacteria", "Proteobacteria", "Alphaproteobacteria"]),
        );
        db.insert("GCF_003", lineage(&["Archaea", "Euryarchaeota"]));
        db
    }

    fn gather_result(name: &str, f_unique: f64, bp: usize) -> GatherResult {
        GatherResult::builder()
            .name(name.into())
            .f_unique_to_query(f_unique)
            .f_unique_weighted(f_unique)
            .unique_intersect_bp(bp)
            .build()
    }

    #[test]
    fn lineage_lookup_with_version_fallback() {
        let db = test_db();
        assert!(db.lookup("GCF_001 some description").is_some());
        assert!(db.lookup("GCF_001.1 some description").is_some());
        assert!(db.lookup("GCF_999").is_none());
    }

    #[test]
    fn summarize_at_phylum() {
        let db = test_db();
        let results = vec![
            gather_result("GCF_001 E. coli", 0.4, 4000),
            gather_result("GCF_002 R. sphaeroides", 0.2, 2000),
            gather_result("GCF_003 M. jannaschii", 0.1, 1000),
        ];

        let summary = summarize_gather_at("phylum", &db, &results, IdentPolicy::Fail).unwrap();
        assert_eq!(summary.len(), 2);

        // both Proteobacteria results collapse into one row
        assert_eq!(summary[0].fraction, 0.6000000000000001);
        assert_eq!(display_lineage(&summary[0].lineage), "Bacteria;Proteobacteria");
        assert_eq!(summary[0].bp_match_at_rank, 6000);

        assert_eq!(summary[1].fraction, 0.1);
        assert_eq!(display_lineage(&summary[1].lineage), "Archaea;Euryarchaeota");
    }

    #[test]
    fn summarize_at_class_splits() {
        let db = test_db();
        let results = vec![
            gather_result("GCF_001", 0.4, 4000),
            gather_result("GCF_002", 0.2, 2000),
        ];

        let summary = summarize_gather_at("class", &db, &results, IdentPolicy::Fail).unwrap();
        assert_eq!(summary.len(), 2);
        assert!(display_lineage(&summary[0].lineage).ends_with("Gammaproteobacteria"));
        assert!(display_lineage(&summary[1].lineage).ends_with("Alphaproteobacteria"));
    }

    #[test]
    fn missing_ident_policies() {
        let db = test_db();
        let results = vec![gather_result("GCF_404 unknown", 0.5, 5000)];

        assert!(matches!(
            summarize_gather_at("phylum", &db, &results, IdentPolicy::Fail),
            Err(Error::MissingIdentifier { .. })
        ));

        let summary =
            summarize_gather_at("phylum", &db, &results, IdentPolicy::Silent).unwrap();
        assert!(summary.is_empty());

        let summary =
            summarize_gather_at("phylum", &db, &results, IdentPolicy::SkipWithWarning).unwrap();
        assert!(summary.is_empty());
    }

    #[test]
    fn lineage_csv_roundtrip() {
        let csv = "ident,superkingdom,phylum,class\n\
                   GCF_001,Bacteria,Proteobacteria,Gammaproteobacteria\n\
                   GCF_003,Archaea,Euryarchaeota,\n";
        let db = LineageDb::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(db.len(), 2);

        let lineage = db.get("GCF_001").unwrap();
        assert_eq!(lineage[0].name, "Bacteria");
        assert_eq!(lineage[2].name, "Gammaproteobacteria");

        // class is empty for the archaeon; pop_to_rank refuses it
        let archaeon = db.get("GCF_003").unwrap();
        assert!(pop_to_rank(archaeon, "class").is_none());
        assert!(pop_to_rank(archaeon, "phylum").is_some());
    }

    #[test]
    fn lineage_sqlite_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let dbfile = dir.path().join("tax.sqldb");

        let db = test_db();
        let conn = Connection::open(&dbfile).unwrap();
        db.save_conn(&conn).unwrap();
        drop(conn);

        let reloaded =
            LineageDb::from_sqlite(PathBuf::from_path_buf(dbfile).unwrap()).unwrap();
        assert_eq!(reloaded.len(), 3);
        let lineage = reloaded.get("GCF_001").unwrap();
        assert_eq!(lineage[1].name, "Proteobacteria");
    }

    #[test]
    fn unknown_rank_is_error() {
        let db = test_db();
        assert!(summarize_gather_at("kingdom", &db, &[], IdentPolicy::Fail).is_err());
    }
}
