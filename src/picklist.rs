use std::collections::HashSet;
use std::io::Read;

use getset::{Getters, Setters};
use typed_builder::TypedBuilder;

use crate::manifest::Record;
use crate::{Error, Result};

/// Which manifest column a picklist matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnType {
    #[default]
    Md5,
    Md5Prefix8,
    Name,
    Ident,
    IdentPrefix,
}

impl ColumnType {
    pub fn from_coltype(coltype: &str) -> Result<Self> {
        match coltype {
            "md5" => Ok(ColumnType::Md5),
            "md5prefix8" | "md5short" => Ok(ColumnType::Md5Prefix8),
            "name" => Ok(ColumnType::Name),
            "ident" => Ok(ColumnType::Ident),
            "identprefix" => Ok(ColumnType::IdentPrefix),
            other => Err(Error::Internal {
                message: format!("unknown picklist column type: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PickStyle {
    #[default]
    Include = 1,
    Exclude = 2,
}

/// Outcome of a picklist check. A miss is a filtering outcome, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickResult {
    Included,
    Excluded,
}

/// A declarative set-membership filter over one manifest column.
#[derive(Default, Debug, Clone, TypedBuilder, Getters, Setters)]
pub struct Picklist {
    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    coltype: ColumnType,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    pickstyle: PickStyle,

    #[getset(get = "pub")]
    #[builder(default)]
    pickset: HashSet<String>,
}

/// First whitespace-delimited token of a signature name.
fn name_to_ident(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or("")
}

/// Identifier with any trailing `.version` stripped.
fn ident_to_prefix(ident: &str) -> &str {
    ident.split('.').next().unwrap_or("")
}

impl Picklist {
    pub fn new(coltype: ColumnType, pickstyle: PickStyle, pickset: HashSet<String>) -> Self {
        Picklist {
            coltype,
            pickstyle,
            pickset,
        }
    }

    /// An md5 include-picklist, the canonical distillation of a manifest
    /// selection.
    pub fn from_md5s(md5s: impl IntoIterator<Item = String>) -> Self {
        Picklist {
            coltype: ColumnType::Md5,
            pickstyle: PickStyle::Include,
            pickset: md5s.into_iter().collect(),
        }
    }

    /// Load a pick set from one named column of a CSV file.
    pub fn from_csv<R: Read>(
        rdr: R,
        column_name: &str,
        coltype: ColumnType,
        pickstyle: PickStyle,
    ) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_reader(rdr);

        let headers = reader.headers()?.clone();
        let col_idx = headers
            .iter()
            .position(|h| h == column_name)
            .ok_or_else(|| Error::Internal {
                message: format!("column '{}' not in picklist file", column_name),
            })?;

        let mut pickset = HashSet::new();
        for row in reader.records() {
            let row = row?;
            if let Some(value) = row.get(col_idx) {
                if !value.is_empty() {
                    pickset.insert(value.to_string());
                }
            }
        }

        Ok(Picklist {
            coltype,
            pickstyle,
            pickset,
        })
    }

    fn value_in_set(&self, row: &Record) -> bool {
        match self.coltype {
            ColumnType::Md5 => self.pickset.contains(row.md5()),
            ColumnType::Md5Prefix8 => self.pickset.contains(row.md5short()),
            ColumnType::Name => self.pickset.contains(row.name()),
            ColumnType::Ident => self.pickset.contains(name_to_ident(row.name())),
            ColumnType::IdentPrefix => self
                .pickset
                .contains(ident_to_prefix(name_to_ident(row.name()))),
        }
    }

    /// Check a manifest row against this picklist.
    pub fn check(&self, row: &Record) -> PickResult {
        let found = self.value_in_set(row);
        let keep = match self.pickstyle {
            PickStyle::Include => found,
            PickStyle::Exclude => !found,
        };
        if keep {
            PickResult::Included
        } else {
            PickResult::Excluded
        }
    }

    pub fn matches_manifest_row(&self, row: &Record) -> bool {
        self.check(row) == PickResult::Included
    }

    /// Direct membership check on an md5 value, bypassing the column
    /// mapping (only meaningful for md5 picklists).
    pub fn matches_md5(&self, md5: &str) -> bool {
        let found = self.pickset.contains(md5);
        match self.pickstyle {
            PickStyle::Include => found,
            PickStyle::Exclude => !found,
        }
    }

    pub fn len(&self) -> usize {
        self.pickset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pickset.is_empty()
    }
}
