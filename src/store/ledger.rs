//! The download archive: an append-only record of durably written items.
//!
//! One line per successful write:
//!
//! ```text
//! <escaped id>\t<path relative to the account dir>\t<content hash>\n
//! ```
//!
//! Lines are never rewritten or removed. Membership is decided at read time and the
//! latest line for an id wins. Appends hold an exclusive lock on the ledger file (and
//! an in-process mutex), reads a shared one.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// What the ledger knows about one id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// File location relative to the account directory.
    pub path: String,
    pub content_hash: String,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, LedgerEntry>,
    /// Current owner id of every recorded path.
    owners: HashMap<String, String>,
    /// Bytes of the file already folded into `entries`.
    offset: u64,
}

impl Index {
    fn insert(&mut self, id: String, entry: LedgerEntry) {
        if let Some(previous) = self.entries.get(&id) {
            if self.owners.get(&previous.path) == Some(&id) {
                self.owners.remove(&previous.path);
            }
        }
        self.owners.insert(entry.path.clone(), id.clone());
        self.entries.insert(id, entry);
    }
}

/// Handle on one `(connector, account)` download archive.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
    index: Mutex<Index>,
}

/// Exclusive hold on the ledger for a check-then-append sequence.
pub struct LedgerLock<'a> {
    ledger: &'a Ledger,
    index: MutexGuard<'a, Index>,
}

impl Ledger {
    /// Open (or create) the ledger at `path` and load its entries.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let ledger = Self {
            path,
            file,
            index: Mutex::new(Index::default()),
        };
        ledger.refresh_shared()?;
        log::debug!(target: "engine::ledger", "Opened download archive {} ({} entries)", ledger.path.display(), ledger.len());

        Ok(ledger)
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        // A panic while holding the index leaves it consistent up to `offset`.
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of distinct ids recorded.
    pub fn len(&self) -> usize {
        self.index().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `id`, picking up lines appended by other processes first.
    pub fn get(&self, id: &str) -> io::Result<Option<LedgerEntry>> {
        self.refresh_shared()?;
        Ok(self.index().entries.get(id).cloned())
    }

    fn refresh_shared(&self) -> io::Result<()> {
        let mut index = self.index();
        self.file.lock_shared()?;
        let result = self.read_new_lines(&mut index);
        self.file.unlock()?;
        result
    }

    /// Take the exclusive lock, then catch up with the file.
    pub fn lock(&self) -> io::Result<LedgerLock<'_>> {
        let mut index = self.index();
        self.file.lock()?;
        if let Err(e) = self.read_new_lines(&mut index) {
            let _ = self.file.unlock();
            return Err(e);
        }
        Ok(LedgerLock {
            ledger: self,
            index,
        })
    }

    fn read_new_lines(&self, index: &mut Index) -> io::Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(index.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // An unterminated tail is an append cut short; it is not an entry (yet).
        let complete = buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        for line in buf[..complete].split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some((id, entry)) => index.insert(id, entry),
                None => {
                    log::warn!(target: "engine::ledger", "Ignoring malformed line in {}: {:?}", self.path.display(), String::from_utf8_lossy(line));
                }
            }
        }
        index.offset += complete as u64;

        Ok(())
    }
}

impl LedgerLock<'_> {
    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.index.entries.get(id)
    }

    /// Id whose latest entry records `path`, if any.
    pub fn owner(&self, path: &str) -> Option<&str> {
        self.index.owners.get(path).map(String::as_str)
    }

    /// Append `id` and make it durable.
    pub fn append(&mut self, id: &str, entry: LedgerEntry) -> io::Result<()> {
        let mut file = &self.ledger.file;
        let len = file.metadata()?.len();

        let mut line = String::new();
        if len > self.index.offset {
            // Terminate the garbage tail of an interrupted append.
            line.push('\n');
        }
        line.push_str(&format_line(id, &entry));

        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        log::trace!(target: "engine::ledger", "Appended {id} to {}", self.ledger.path.display());
        self.index.insert(id.to_string(), entry);
        Ok(())
    }
}

impl Drop for LedgerLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ledger.file.unlock() {
            log::warn!(target: "engine::ledger", "Unable to unlock {}: {e}", self.ledger.path.display());
        }
    }
}

fn format_line(id: &str, entry: &LedgerEntry) -> String {
    format!(
        "{}\t{}\t{}\n",
        escape(id),
        escape(&entry.path),
        escape(&entry.content_hash)
    )
}

fn parse_line(line: &[u8]) -> Option<(String, LedgerEntry)> {
    let line = std::str::from_utf8(line).ok()?;
    let mut fields = line.split('\t');
    let id = unescape(fields.next()?)?;
    let path = unescape(fields.next()?)?;
    let content_hash = unescape(fields.next()?)?;
    if fields.next().is_some() || id.is_empty() {
        return None;
    }
    Some((id, LedgerEntry { path, content_hash }))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn entry(path: &str) -> LedgerEntry {
        LedgerEntry {
            path: path.into(),
            content_hash: format!("sha256:{path}"),
        }
    }

    #[test]
    fn appended_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.txt");

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_empty());
        ledger.lock().unwrap().append("a", entry("x/a")).unwrap();
        ledger.lock().unwrap().append("b", entry("x/b")).unwrap();
        drop(ledger);

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get("a").unwrap(), Some(entry("x/a")));
        assert_eq!(ledger.get("missing").unwrap(), None);
    }

    #[test]
    fn file_is_append_only_and_latest_line_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.txt");

        let ledger = Ledger::open(&path).unwrap();
        ledger.lock().unwrap().append("a", entry("old")).unwrap();
        let before = fs::read_to_string(&path).unwrap();
        ledger.lock().unwrap().append("a", entry("new")).unwrap();
        let after = fs::read_to_string(&path).unwrap();

        assert!(after.starts_with(&before));
        assert_eq!(after.lines().count(), 2);
        assert_eq!(ledger.get("a").unwrap(), Some(entry("new")));
    }

    #[test]
    fn sees_appends_from_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.txt");

        let first = Ledger::open(&path).unwrap();
        let second = Ledger::open(&path).unwrap();
        second.lock().unwrap().append("late", entry("p")).unwrap();

        assert_eq!(first.get("late").unwrap(), Some(entry("p")));
        assert!(first.lock().unwrap().get("late").is_some());
    }

    #[test]
    fn interrupted_append_is_ignored_and_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.txt");
        fs::write(&path, "a\tx/a\tsha256:1\nb\tx/").unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("b").unwrap(), None);

        ledger.lock().unwrap().append("c", entry("x/c")).unwrap();
        drop(ledger);

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.get("c").unwrap(), Some(entry("x/c")));
        // the cut-short line is now terminated but still malformed
        assert_eq!(ledger.get("b").unwrap(), None);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn paths_are_owned_by_their_latest_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.txt");

        let ledger = Ledger::open(&path).unwrap();
        ledger.lock().unwrap().append("a", entry("x/one")).unwrap();
        ledger.lock().unwrap().append("a", entry("x/two")).unwrap();
        drop(ledger);

        let ledger = Ledger::open(&path).unwrap();
        let lock = ledger.lock().unwrap();
        assert_eq!(lock.owner("x/two"), Some("a"));
        assert_eq!(lock.owner("x/one"), None);
        assert_eq!(lock.owner("x/other"), None);
    }

    #[test]
    fn awkward_ids_are_escaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.txt");
        let id = "tab\there\nnew\\line";

        let ledger = Ledger::open(&path).unwrap();
        ledger.lock().unwrap().append(id, entry("p")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
        drop(ledger);

        assert_eq!(Ledger::open(&path).unwrap().get(id).unwrap(), Some(entry("p")));
    }
}
