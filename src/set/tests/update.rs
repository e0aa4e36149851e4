use super::{TestSet, random_bytes};
use crate::block::BLOCK_SIZE;
use crate::freespace::FreeRange;
use crate::types::{DriveStatus, Event};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn create_builds_parity_that_verifies_clean() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE + 100, 1));
    fx.write(1, "b.bin", &random_bytes(3 * BLOCK_SIZE - 17, 2));

    let set = fx.open().await;
    assert!(set.is_empty().await.unwrap());

    let cancel = CancellationToken::new();
    let summary = set.update(true, &cancel).await.unwrap();

    assert_eq!(summary.files_added, 2);
    assert!(!set.is_empty().await.unwrap());

    let verify = set.verify(&cancel).await.unwrap();
    assert_eq!(verify.mismatches, 0, "a fresh build must verify clean");
    assert_eq!(verify.blocks_checked, 3, "extent is the largest drive (3 blocks)");
}

#[tokio::test]
async fn cancelled_create_leaves_an_empty_never_built_volume() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(2 * BLOCK_SIZE, 3));
    fx.write(1, "b.bin", &random_bytes(BLOCK_SIZE, 4));

    let set = fx.open().await;
    set.scan_all(&CancellationToken::new()).await.unwrap();

    // cancel fires after the first parity block is written
    let cancel = CancellationToken::new();
    cancel.cancel();
    set.update(false, &cancel).await.unwrap();

    assert!(
        set.is_empty().await.unwrap(),
        "a cancelled initial build must reset to empty"
    );
    assert!(
        !fx.parity.path().join("parity0.dat").exists(),
        "no partial parity data may survive"
    );
    assert!(
        !fx.parity.path().join("files1.dat").exists(),
        "no partial inventories may survive"
    );
}

#[tokio::test]
async fn removing_an_appended_file_restores_the_prior_parity_bytes() {
    // Round trip through the full-recompute removal path: parity with a
    // file added and then removed must be byte-identical to parity where
    // the file never existed.
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE - 5, 10));
    fx.write(1, "b.bin", &random_bytes(2 * BLOCK_SIZE - 300, 11));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();
    let baseline = fx.parity_bytes();

    // add a non-block-aligned file, then delete it from disk so removal
    // cannot take the fast path (the file is gone) and must recompute
    fx.write(0, "c.bin", &random_bytes(2 * BLOCK_SIZE + 123, 12));
    set.update(true, &cancel).await.unwrap();
    assert_ne!(fx.parity_bytes(), baseline, "the add must change parity");

    fx.delete(0, "c.bin");
    let summary = set.update(true, &cancel).await.unwrap();

    assert_eq!(summary.files_removed, 1);
    assert!(summary.blocks_reclaimed > 0, "tail blocks must be trimmed");
    assert_eq!(
        fx.parity_bytes(),
        baseline,
        "parity after add+remove must equal never-added parity"
    );
    assert_eq!(
        std::fs::read_dir(fx.temp.path()).unwrap().count(),
        0,
        "no staging files may be left behind in the temp directory"
    );
}

#[tokio::test]
async fn fast_remove_of_unmodified_files_keeps_parity_consistent() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(2 * BLOCK_SIZE + 7, 20));
    fx.write(1, "b.bin", &random_bytes(3 * BLOCK_SIZE, 21));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    // the files are still on disk and unmodified, so this removal runs the
    // self-inverse fast path (no sibling reads)
    let summary = set.remove_all_files(0, &cancel).await.unwrap();
    assert_eq!(summary.files_removed, 1);

    let drives = set.drives().await.unwrap();
    assert_eq!(drives[0].files, 0);

    let verify = set.verify(&cancel).await.unwrap();
    assert_eq!(
        verify.mismatches, 0,
        "parity must be consistent after a fast remove"
    );
}

#[tokio::test]
async fn best_fit_allocation_reuses_a_freed_range() {
    let fx = TestSet::new(1);
    fx.write(0, "head.bin", &random_bytes(BLOCK_SIZE, 30));
    fx.write(0, "middle.bin", &random_bytes(3 * BLOCK_SIZE, 31));
    fx.write(0, "tail.bin", &random_bytes(BLOCK_SIZE, 32));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    // free the 3-block middle range
    fx.delete(0, "middle.bin");
    set.update(true, &cancel).await.unwrap();

    // a 2-block file fits into the hole; the leftover block stays free
    fx.write(0, "newcomer.bin", &random_bytes(2 * BLOCK_SIZE, 33));
    set.update(true, &cancel).await.unwrap();

    let engine = set.engine.lock().unwrap();
    let drive = &engine.drives[0];
    let newcomer = drive
        .files()
        .iter()
        .find(|r| r.name == PathBuf::from("newcomer.bin"))
        .expect("newcomer must be tracked");
    assert_eq!(
        newcomer.start_block, 1,
        "the freed middle range starts at block 1 and is the best fit"
    );
    assert_eq!(
        drive.free_list(),
        &[FreeRange::new(3, 1)],
        "the unused tail of the reused range becomes a new free range"
    );
    drop(engine);

    let verify = set.verify(&cancel).await.unwrap();
    assert_eq!(verify.mismatches, 0);
}

#[tokio::test]
async fn update_applies_deletes_before_adds() {
    // Delete a 2-block file and add a 2-block file in the same pass: the
    // newcomer must land in the freed range, which only happens when the
    // delete is processed first.
    let fx = TestSet::new(1);
    fx.write(0, "old.bin", &random_bytes(2 * BLOCK_SIZE, 40));
    fx.write(0, "anchor.bin", &random_bytes(BLOCK_SIZE, 41));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    let old_start = {
        let engine = set.engine.lock().unwrap();
        engine.drives[0]
            .files()
            .iter()
            .find(|r| r.name == PathBuf::from("old.bin"))
            .unwrap()
            .start_block
    };

    fx.delete(0, "old.bin");
    fx.write(0, "new.bin", &random_bytes(2 * BLOCK_SIZE, 42));
    let summary = set.update(true, &cancel).await.unwrap();
    assert_eq!(summary.files_removed, 1);
    assert_eq!(summary.files_added, 1);

    let engine = set.engine.lock().unwrap();
    let new_start = engine.drives[0]
        .files()
        .iter()
        .find(|r| r.name == PathBuf::from("new.bin"))
        .unwrap()
        .start_block;
    assert_eq!(
        new_start, old_start,
        "the add must reuse the range freed by the delete in the same pass"
    );
}

#[tokio::test]
async fn zero_length_files_are_tracked_without_parity_blocks() {
    let fx = TestSet::new(1);
    fx.write(0, "empty.bin", b"");
    fx.write(0, "real.bin", &random_bytes(BLOCK_SIZE, 50));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    let summary = set.update(true, &cancel).await.unwrap();
    assert_eq!(summary.files_added, 2);

    let drives = set.drives().await.unwrap();
    assert_eq!(drives[0].files, 2);
    assert_eq!(drives[0].blocks, 1, "only the real file occupies blocks");

    let check = set.hashcheck(None, &cancel).await.unwrap();
    assert_eq!(check.failures, 0);
}

#[tokio::test]
async fn modified_file_is_replaced_through_delete_then_add() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE + 9, 60));
    fx.write(1, "b.bin", &random_bytes(2 * BLOCK_SIZE, 61));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    // rewrite with different length: scan yields a delete/add pair and the
    // stale record is flagged modified, forcing the recompute removal path
    let replacement = random_bytes(2 * BLOCK_SIZE + 33, 62);
    fx.write(0, "a.bin", &replacement);

    let summary = set.update(true, &cancel).await.unwrap();
    assert_eq!(summary.files_removed, 1);
    assert_eq!(summary.files_added, 1);

    let verify = set.verify(&cancel).await.unwrap();
    assert_eq!(verify.mismatches, 0, "replacement must leave parity consistent");

    let check = set.hashcheck(Some(0), &cancel).await.unwrap();
    assert_eq!(check.failures, 0, "the new content hash must be recorded");
}

#[tokio::test]
async fn update_reports_scan_and_completion_events() {
    let fx = TestSet::new(1);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE, 70));

    let set = fx.open().await;
    let mut events = set.subscribe();
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    let events = super::drain_events(&mut events);
    assert!(
        events.iter().any(|e| matches!(e, Event::ScanStarted { .. })),
        "scan start must be announced"
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::UpdateComplete { summary } if summary.files_added == 1)),
        "completion must carry the summary, got {events:?}"
    );
}

#[tokio::test]
async fn drive_status_reflects_pending_work_and_completion() {
    let fx = TestSet::new(1);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE, 80));

    let set = fx.open().await;
    let cancel = CancellationToken::new();

    set.scan_all(&cancel).await.unwrap();
    let drives = set.drives().await.unwrap();
    assert_eq!(
        drives[0].status,
        DriveStatus::UpdateRequired { adds: 1, deletes: 0, moves: 0 }
    );

    set.update(false, &cancel).await.unwrap();
    let drives = set.drives().await.unwrap();
    assert_eq!(drives[0].status, DriveStatus::UpToDate);
}

#[tokio::test]
async fn add_drive_assigns_the_next_free_metafile_name() {
    let fx = TestSet::new(2);
    let set = fx.open().await;

    let extra = TempDir::new().unwrap();
    let drive_config = set.add_drive(extra.path()).await.unwrap();
    assert_eq!(drive_config.metafile, "files3.dat");
    assert_eq!(set.drives().await.unwrap().len(), 3);

    // adding the same root twice is refused
    let err = set.add_drive(extra.path()).await.unwrap_err();
    assert!(matches!(err, crate::error::Error::InvalidDrive(_)));
}

#[tokio::test]
async fn remove_empty_drive_refuses_while_files_are_tracked() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE, 90));
    fx.write(1, "b.bin", &random_bytes(BLOCK_SIZE, 91));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    let err = set.remove_empty_drive(0).await.unwrap_err();
    assert!(matches!(
        err,
        crate::error::Error::DriveNotEmpty { files: 1, .. }
    ));

    set.remove_all_files(0, &cancel).await.unwrap();
    set.remove_empty_drive(0).await.unwrap();
    assert_eq!(set.drives().await.unwrap().len(), 1);
    assert!(
        !fx.parity.path().join("files1.dat").exists(),
        "the removed drive's metadata file must be deleted"
    );
}

#[tokio::test]
async fn check_available_space_passes_for_a_small_initial_build() {
    let fx = TestSet::new(1);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE, 95));

    let set = fx.open().await;
    set.scan_all(&CancellationToken::new()).await.unwrap();
    assert!(set.check_available_space_for_update().await.unwrap());
}
