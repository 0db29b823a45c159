use std::process::ExitCode;

use snap_backup_lib::cli::{Action, BackupArgs, Cli, StatusArgs};
use snap_backup_lib::config::Config;
use snap_backup_lib::connector::local::{LocalDir, LOCAL_CONNECTOR_ID};
use snap_backup_lib::guard::{GuardOutcome, IdempotencyGuard};
use snap_backup_lib::layout::SnapshotLayout;
use snap_backup_lib::model::{RunStatus, SnapshotRequest};
use snap_backup_lib::orchestrator::SnapshotOrchestrator;

use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let config = match Config::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.action {
        Action::Backup(args) => backup(config, args),
        Action::Status(args) => status(&config, args),
    }
}

fn backup(mut config: Config, args: BackupArgs) -> ExitCode {
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }

    let request = SnapshotRequest::new(
        LOCAL_CONNECTOR_ID,
        &args.snapshot.account,
        &config.local.content_type,
        args.snapshot.snapshot_date(),
        &args.snapshot.output_root,
    )
    .with_filters(args.filters());

    let connector = LocalDir::new(&args.source, &args.snapshot.account);
    let orchestrator = SnapshotOrchestrator::new(connector, config.engine);

    let manifest = match orchestrator.run(&request) {
        Ok(manifest) => manifest,
        Err(e) => {
            log::error!(target: "engine", "Snapshot of {} resulted in a fatal error: {e}", args.source.display());
            return ExitCode::FAILURE;
        }
    };

    for error in &manifest.errors {
        let item = error.item_id.as_deref().unwrap_or("<run>");
        log::warn!(target: "engine", "{item}: {} ({})", error.message, error.kind);
    }
    log::info!(
        target: "engine",
        "Snapshot {} {}: {} items, {} succeeded ({} already archived), {} failed",
        manifest.snapshot_date,
        manifest.status,
        manifest.item_count,
        manifest.succeeded_count,
        manifest.deduplicated_count,
        manifest.failed_count(),
    );

    match manifest.status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Partial => ExitCode::from(2),
        RunStatus::Running | RunStatus::Failed => ExitCode::FAILURE,
    }
}

fn status(config: &Config, args: StatusArgs) -> ExitCode {
    let content_type = args
        .content_type
        .as_deref()
        .unwrap_or(&config.local.content_type);
    let request = SnapshotRequest::new(
        &args.connector,
        &args.snapshot.account,
        content_type,
        args.snapshot.snapshot_date(),
        &args.snapshot.output_root,
    );
    let layout = SnapshotLayout::new(&request);

    match IdempotencyGuard.check(&layout) {
        GuardOutcome::Complete(manifest) => {
            match serde_json::to_string_pretty(&manifest) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    log::error!("Rendering the manifest failed: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        GuardOutcome::Incomplete => {
            log::warn!(
                "No complete snapshot for {} at {}",
                request.snapshot_date(),
                layout.snapshot_dir().display()
            );
            ExitCode::FAILURE
        }
    }
}
