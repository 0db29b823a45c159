//! Per-item metadata kept next to the stored files.
//!
//! Every stored item gets `.metadata/<file name>.json` in its snapshot directory with the
//! connector's metadata and the outcome of the download. The only timestamp that is not
//! remote metadata is `as_of`, the snapshot date.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::layout::METADATA_DIR;
use crate::model::{ItemMetadata, ItemResult};
use crate::util::atomic::write_atomic;

/// Content of a metadata file. Keys serialize in alphabetical order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ItemRecord {
    pub as_of: DateTime<Utc>,
    pub id: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub result: ItemResult,
    pub size: Option<u64>,
}

impl ItemRecord {
    pub fn new(item: &ItemMetadata, result: &ItemResult, as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            id: item.id.clone(),
            last_modified: item.last_modified,
            payload: item.payload.clone(),
            result: result.clone(),
            size: item.size,
        }
    }

    /// Read the record at `path`.
    pub fn read(path: &Path) -> io::Result<Self> {
        let content = std::fs::read(path)?;
        serde_json::from_slice(&content).map_err(io::Error::other)
    }

    /// Atomically write the record to `path`, creating its directory.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut content = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        content.push(b'\n');
        write_atomic(path, &content)
    }
}

/// Location of the metadata file of the item stored at `file`.
pub fn record_path(file: &Path) -> Option<PathBuf> {
    let name = file.file_name()?.to_string_lossy();
    Some(file.parent()?.join(METADATA_DIR).join(format!("{name}.json")))
}
