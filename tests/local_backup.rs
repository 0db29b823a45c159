mod common;

use std::fs;
use std::path::Path;

use common::{date, engine};
use sha2::{Digest, Sha256};
use snap_backup_lib::connector::local::{LocalDir, LocalError, LOCAL_CONNECTOR_ID};
use snap_backup_lib::connector::{Connector, ErrorClass, ItemStream};
use snap_backup_lib::guard::{GuardOutcome, IdempotencyGuard};
use snap_backup_lib::layout::SnapshotLayout;
use snap_backup_lib::model::{ItemMetadata, ListFilters, RunStatus, SnapshotRequest};
use snap_backup_lib::orchestrator::SnapshotOrchestrator;
use snap_backup_lib::store::{format_hash, metadata, ItemRecord};

fn populate(source: &Path) {
    fs::create_dir_all(source.join("photos/2024")).unwrap();
    fs::write(source.join("notes.txt"), b"remember the milk").unwrap();
    fs::write(source.join("photos/2024/cat.jpg"), b"not really a jpeg").unwrap();
    fs::write(source.join("todo.md"), b"- [ ] backups").unwrap();
}

fn local_request(root: &Path, day: u32) -> SnapshotRequest {
    SnapshotRequest::new(LOCAL_CONNECTOR_ID, "me", "files", date(day), root)
}

#[test]
fn backs_up_a_directory_once() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(source.path());
    let req = local_request(output.path(), 1);
    let layout = SnapshotLayout::new(&req);

    let orchestrator = SnapshotOrchestrator::new(LocalDir::new(source.path(), "me"), engine(1));
    let manifest = orchestrator.run(&req).unwrap();

    assert_eq!(manifest.status, RunStatus::Succeeded);
    assert_eq!(manifest.item_count, 3);
    assert_eq!(manifest.succeeded_count, 3);
    assert_eq!(manifest.deduplicated_count, 0);
    assert_eq!(manifest.total_bytes, 17 + 17 + 13);

    let notes = manifest
        .items
        .iter()
        .find(|i| i.item_id == "notes.txt")
        .unwrap();
    assert_eq!(notes.path.as_deref(), Some("files/2025-03-01/notes.txt"));
    assert_eq!(
        notes.content_hash.as_deref(),
        Some(format_hash(&Sha256::digest(b"remember the milk")).as_str())
    );
    assert_eq!(
        fs::read(layout.item_path("notes.txt")).unwrap(),
        b"remember the milk"
    );
    assert_eq!(
        fs::read(layout.item_path("photos/2024/cat.jpg")).unwrap(),
        b"not really a jpeg"
    );

    // no temp files left behind
    let partials = fs::read_dir(layout.snapshot_dir())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .count();
    assert_eq!(partials, 0);

    match IdempotencyGuard.check(&layout) {
        GuardOutcome::Complete(stored) => assert_eq!(stored, manifest),
        GuardOutcome::Incomplete => panic!("snapshot should be complete"),
    }

    // a changed source does not alter a completed snapshot
    fs::write(source.path().join("late.txt"), b"too late").unwrap();
    let again = SnapshotOrchestrator::new(LocalDir::new(source.path(), "me"), engine(1))
        .run(&req)
        .unwrap();
    assert_eq!(again, manifest);
    assert!(!layout.item_path("late.txt").exists());
}

#[test]
fn next_day_only_fetches_new_files() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(source.path());

    SnapshotOrchestrator::new(LocalDir::new(source.path(), "me"), engine(2))
        .run(&local_request(output.path(), 1))
        .unwrap();

    fs::write(source.path().join("new.txt"), b"fresh").unwrap();
    let req = local_request(output.path(), 2);
    let manifest = SnapshotOrchestrator::new(LocalDir::new(source.path(), "me"), engine(2))
        .run(&req)
        .unwrap();

    assert_eq!(manifest.status, RunStatus::Succeeded);
    assert_eq!(manifest.item_count, 4);
    assert_eq!(manifest.deduplicated_count, 3);
    assert_eq!(manifest.total_bytes, 5);

    let layout = SnapshotLayout::new(&req);
    assert_eq!(fs::read(layout.item_path("new.txt")).unwrap(), b"fresh");
    assert!(!layout.item_path("notes.txt").exists());
}

#[test]
fn vanished_file_is_a_permanent_failure() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(source.path());

    struct Vanishing(LocalDir);

    impl Connector for Vanishing {
        type Error = LocalError;

        fn list_items(&self, filters: &ListFilters) -> Result<Vec<ItemMetadata>, LocalError> {
            let items = self.0.list_items(filters)?;
            fs::remove_file(self.0.source().join("todo.md")).unwrap();
            Ok(items)
        }

        fn fetch_item(&self, item: &ItemMetadata) -> Result<ItemStream, LocalError> {
            self.0.fetch_item(item)
        }

        fn classify(&self, error: &LocalError) -> ErrorClass {
            self.0.classify(error)
        }

        fn account_identity(&self) -> String {
            self.0.account_identity()
        }
    }

    let connector = Vanishing(LocalDir::new(source.path(), "me"));
    let manifest = SnapshotOrchestrator::new(connector, engine(1))
        .run(&local_request(output.path(), 1))
        .unwrap();

    assert_eq!(manifest.status, RunStatus::Partial);
    assert_eq!(manifest.succeeded_count, 2);
    assert_eq!(manifest.failed_permanent_count, 1);
    assert_eq!(manifest.errors[0].item_id.as_deref(), Some("todo.md"));
}

#[test]
fn metadata_files_describe_each_backed_up_file() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(source.path());
    let req = local_request(output.path(), 1);
    let layout = SnapshotLayout::new(&req);

    let manifest = SnapshotOrchestrator::new(LocalDir::new(source.path(), "me"), engine(1))
        .run(&req)
        .unwrap();

    let path = metadata::record_path(&layout.item_path("notes.txt")).unwrap();
    assert_eq!(path, layout.snapshot_dir().join(".metadata/notes.txt.json"));
    let record = ItemRecord::read(&path).unwrap();
    assert_eq!(record.id, "notes.txt");
    assert_eq!(record.as_of.to_rfc3339(), "2025-03-01T00:00:00+00:00");
    assert_eq!(record.size, Some(17));
    assert_eq!(
        record.payload["source"],
        source.path().join("notes.txt").display().to_string().as_str()
    );
    assert_eq!(
        record.result.content_hash.as_deref(),
        Some(format_hash(&Sha256::digest(b"remember the milk")).as_str())
    );
    let stored = manifest.items.iter().find(|i| i.item_id == "notes.txt").unwrap();
    assert_eq!(&record.result, stored);

    // nested ids are flattened into one metadata file each
    let cat = metadata::record_path(&layout.item_path("photos/2024/cat.jpg")).unwrap();
    assert_eq!(ItemRecord::read(&cat).unwrap().id, "photos/2024/cat.jpg");

    let before = fs::read(&path).unwrap();
    SnapshotOrchestrator::new(LocalDir::new(source.path(), "me"), engine(1))
        .run(&req)
        .unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
}
