//! Implements a [Connector] over a local directory using [LocalDir].

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};

use super::{Connector, ErrorClass, ItemStream};
use crate::model::{ItemMetadata, ListFilters};

/// Identifier of the [LocalDir] connector in the output layout.
pub const LOCAL_CONNECTOR_ID: &str = "local";

/// Backs up every regular file below a source directory.
///
/// Item ids are the `/`-separated paths relative to the source directory. The payload
/// records the absolute source path and whether the file is read-only.
#[derive(Debug, Clone)]
pub struct LocalDir {
    source: PathBuf,
    account: String,
}

/// I/O failure while listing or reading a source file.
#[derive(Debug, Display, Error)]
#[display("{}: {source}", path.display())]
pub struct LocalError {
    path: PathBuf,
    source: io::Error,
}

impl LocalError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

impl LocalDir {
    /// Create a new [LocalDir] connector reading from `source` on behalf of `account`.
    pub fn new(source: impl Into<PathBuf>, account: impl Into<String>) -> Self {
        let source = source.into();
        if source.is_relative() {
            log::warn!(target: "connector::local", "source is relative: {}", source.display());
        }

        Self {
            source,
            account: account.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn walk(&self, dir: &Path, items: &mut Vec<ItemMetadata>) -> Result<(), LocalError> {
        for entry in fs::read_dir(dir).map_err(|e| LocalError::new(dir, e))? {
            let entry = entry.map_err(|e| LocalError::new(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| LocalError::new(&path, e))?;

            if file_type.is_dir() {
                self.walk(&path, items)?;
                continue;
            }
            if !file_type.is_file() {
                log::debug!(target: "connector::local", "Skipping non-regular file: {}", path.display());
                continue;
            }

            let metadata = entry.metadata().map_err(|e| LocalError::new(&path, e))?;
            let Some(id) = relative_id(&self.source, &path) else {
                log::warn!(target: "connector::local", "Skipping file with non UTF-8 path: {}", path.display());
                continue;
            };

            let payload = serde_json::json!({
                "readonly": metadata.permissions().readonly(),
                "source": path.display().to_string(),
            });
            let mut item = ItemMetadata::new(id)
                .sized(metadata.len())
                .with_payload(payload);
            if let Ok(modified) = metadata.modified() {
                item = item.modified(DateTime::<Utc>::from(modified));
            }
            items.push(item);
        }

        Ok(())
    }

    fn resolve(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        plain.then(|| self.source.join(relative))
    }
}

fn relative_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

impl Connector for LocalDir {
    type Error = LocalError;

    fn list_items(&self, filters: &ListFilters) -> Result<Vec<ItemMetadata>, Self::Error> {
        log::debug!(target: "connector::local", "Listing files below {}", self.source.display());

        let mut items = Vec::new();
        self.walk(&self.source, &mut items)?;

        if let Some(cutoff) = filters.modified_after {
            items.retain(|item| item.last_modified.is_none_or(|ts| ts >= cutoff));
        }

        log::debug!(target: "connector::local", "Found {} files", items.len());
        Ok(items)
    }

    fn fetch_item(&self, item: &ItemMetadata) -> Result<ItemStream, Self::Error> {
        let path = self.resolve(&item.id).ok_or_else(|| {
            let err = io::Error::new(io::ErrorKind::NotFound, "id escapes the source directory");
            LocalError::new(Path::new(&item.id), err)
        })?;

        let file = File::open(&path).map_err(|e| LocalError::new(&path, e))?;
        Ok(Box::new(file))
    }

    fn classify(&self, error: &Self::Error) -> ErrorClass {
        match error.kind() {
            io::ErrorKind::PermissionDenied => ErrorClass::Fatal,
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }

    fn account_identity(&self) -> String {
        self.account.clone()
    }
}
