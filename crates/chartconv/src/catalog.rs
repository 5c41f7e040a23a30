//! Cell catalog: authoritative metadata keyed by cell id.

use std::{collections::HashMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use senc::Cell;
use serde::Deserialize;

/// Catalog numbers show up both as JSON numbers and as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

impl Number {
    fn get<T: TryFrom<u64>>(&self) -> Option<T> {
        let v = match self {
            Number::Int(v) => *v,
            Number::Text(s) => s.trim().parse().ok()?,
        };
        T::try_from(v).ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    c_title: Option<String>,
    c_scale: Option<Number>,
    #[serde(rename = "editionNumber")]
    edition_number: Option<Number>,
    #[serde(rename = "updateNumber")]
    update_number: Option<Number>,
    #[serde(rename = "editionDate")]
    edition_date: Option<String>,
    #[serde(rename = "issueDate")]
    issue_date: Option<String>,
}

impl CatalogEntry {
    /// Overwrite the metadata computed from the features with the catalog's.
    pub fn apply(&self, cell: &mut Cell) {
        if let Some(title) = &self.c_title {
            cell.name = title.clone();
        }
        if let Some(scale) = self.c_scale.as_ref().and_then(Number::get) {
            cell.native_scale = scale;
        }
        if let Some(edition) = self.edition_number.as_ref().and_then(Number::get) {
            cell.edition = edition;
        }
        if let Some(update) = self.update_number.as_ref().and_then(Number::get) {
            cell.update = update;
        }
        if let Some(date) = &self.edition_date {
            cell.publish_date = date.clone();
        }
        if let Some(date) = &self.issue_date {
            cell.update_date = date.clone();
        }
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let entries = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing catalog {}", path.display()))?;

        Ok(Self { entries })
    }

    pub fn get(&self, cell: &str) -> Option<&CatalogEntry> {
        self.entries.get(cell)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
