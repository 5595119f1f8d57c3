//! Saved set of detected streams, so a later run can skip detection.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::registry::PortList;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub identifier: String,
    pub ports: PortList,
    pub detection: Detection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCatalog {
    pub streams: Vec<CatalogEntry>,
}

impl StreamCatalog {
    /// Add `identifier`, merging ports into an existing entry of the same name.
    pub fn record(&mut self, identifier: &str, ports: PortList, detection: Detection) {
        if let Some(e) = self.streams.iter_mut().find(|e| e.identifier == identifier) {
            for p in ports.iter() {
                e.ports.insert(p);
            }
            return;
        }
        self.streams.push(CatalogEntry { identifier: identifier.to_string(), ports, detection });
    }

    pub fn merge(&mut self, other: StreamCatalog) {
        for e in other.streams {
            self.record(&e.identifier, e.ports, e.detection);
        }
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        bincode::serialize_into(&mut out, self)?;
        out.flush()?;
        Ok(())
    }
}
