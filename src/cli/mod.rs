use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::connector::local::LOCAL_CONNECTOR_ID;
use crate::model::ListFilters;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. Written with defaults if it doesn't exist.
    #[arg(long, short = 'c', env = "SNAP_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Take today's (or the given day's) snapshot of a local directory.
    Backup(BackupArgs),
    /// Show the manifest of a snapshot without running it.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Root folder of all snapshots.
    #[arg(long, short = 'r', env = "SNAP_BACKUP_ROOT")]
    pub output_root: PathBuf,

    /// Account the snapshot belongs to.
    #[arg(long, short = 'a')]
    pub account: String,

    /// Calendar day (UTC) of the snapshot. Defaults to today.
    #[arg(long, short = 'd')]
    pub date: Option<NaiveDate>,
}

impl SnapshotArgs {
    /// The requested day, or today's date in UTC.
    pub fn snapshot_date(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| Utc::now().date_naive())
    }
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(flatten)]
    pub snapshot: SnapshotArgs,

    /// Directory to back up.
    #[arg(long, short = 's')]
    pub source: PathBuf,

    /// Only back up files modified at or after this instant (RFC 3339).
    #[arg(long)]
    pub modified_after: Option<DateTime<Utc>>,

    /// Back up at most this many files.
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Number of files processed concurrently. Overrides the config file.
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,
}

impl BackupArgs {
    pub fn filters(&self) -> ListFilters {
        ListFilters {
            modified_after: self.modified_after,
            max_items: self.max_items,
        }
    }
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub snapshot: SnapshotArgs,

    /// Connector the snapshot was taken with.
    #[arg(long, default_value = LOCAL_CONNECTOR_ID)]
    pub connector: String,

    /// Content type of the snapshot. Defaults to the one of the local connector.
    #[arg(long)]
    pub content_type: Option<String>,
}
