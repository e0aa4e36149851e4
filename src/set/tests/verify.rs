use super::{TestSet, random_bytes};
use crate::block::BLOCK_SIZE;
use crate::types::Event;
use tokio_util::sync::CancellationToken;

/// Deliberately corrupt one stored parity block on disk
fn corrupt_parity_block(fx: &TestSet, block: u64) {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(fx.parity.path().join("parity0.dat"))
        .unwrap();
    file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64)).unwrap();
    file.write_all(&[0xEE; 64]).unwrap();
}

/// Rewrite a data file in place and push its mtime forward so the next
/// scan reliably notices the change
fn modify_file(fx: &TestSet, drive: usize, name: &str, contents: &[u8]) {
    let path = fx.data[drive].path().join(name);
    std::fs::write(&path, contents).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(2))
        .unwrap();
}

#[tokio::test]
async fn corruption_with_unmodified_owner_is_repaired() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(2 * BLOCK_SIZE - 50, 100));
    fx.write(1, "b.bin", &random_bytes(BLOCK_SIZE, 101));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    corrupt_parity_block(&fx, 0);

    let mut events = set.subscribe();
    let summary = set.verify(&cancel).await.unwrap();
    assert_eq!(summary.mismatches, 1);
    assert_eq!(
        summary.repaired, 1,
        "pure parity-side corruption with unmodified owners must self-heal"
    );

    let events = super::drain_events(&mut events);
    assert!(
        events.iter().any(|e| matches!(e, Event::BlockRepaired { block: 0 })),
        "the repair must be announced, got {events:?}"
    );

    // a second pass sees clean parity
    let summary = set.verify(&cancel).await.unwrap();
    assert_eq!(summary.mismatches, 0);
}

#[tokio::test]
async fn mismatch_with_a_modified_owner_is_reported_but_left_alone() {
    let fx = TestSet::new(2);
    let original = random_bytes(BLOCK_SIZE + 40, 110);
    fx.write(0, "a.bin", &original);
    fx.write(1, "b.bin", &random_bytes(BLOCK_SIZE, 111));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    // change the file's content; the scan flags the record as modified
    let mut changed = original.clone();
    changed[10] ^= 0xFF;
    modify_file(&fx, 0, "a.bin", &changed);
    set.scan_all(&cancel).await.unwrap();

    let parity_before = fx.parity_bytes();
    let mut events = set.subscribe();
    let summary = set.verify(&cancel).await.unwrap();

    assert!(summary.mismatches >= 1);
    assert_eq!(
        summary.repaired, 0,
        "no safe repair exists while an owner is modified"
    );
    assert_eq!(
        fx.parity_bytes(),
        parity_before,
        "stored parity must not be touched"
    );

    let events = super::drain_events(&mut events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::BlockUnrepairable { .. })),
        "the unrepairable mismatch must be announced"
    );
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::Error { message } if message.contains("(MODIFIED)")
        )),
        "the modified owner must be named, got {events:?}"
    );
}

#[tokio::test]
async fn each_suspect_file_is_reported_once_per_pass() {
    // one file spanning several blocks, all corrupted: the file is named
    // once even though every one of its blocks mismatches
    let fx = TestSet::new(1);
    fx.write(0, "wide.bin", &random_bytes(3 * BLOCK_SIZE, 120));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    for block in 0..3 {
        corrupt_parity_block(&fx, block);
    }

    let mut events = set.subscribe();
    let summary = set.verify(&cancel).await.unwrap();
    assert_eq!(summary.mismatches, 3);
    assert_eq!(summary.repaired, 3);

    let events = super::drain_events(&mut events);
    let mentions = events
        .iter()
        .filter(|e| matches!(e, Event::Error { message } if message.contains("wide.bin")))
        .count();
    assert_eq!(mentions, 1, "one report per file per pass, got {events:?}");
}

#[tokio::test]
async fn verify_of_an_untouched_set_reports_nothing() {
    let fx = TestSet::new(2);
    fx.write(0, "a.bin", &random_bytes(BLOCK_SIZE * 2, 130));
    fx.write(1, "b.bin", &random_bytes(BLOCK_SIZE / 2, 131));

    let set = fx.open().await;
    let cancel = CancellationToken::new();
    set.update(true, &cancel).await.unwrap();

    let mut events = set.subscribe();
    let summary = set.verify(&cancel).await.unwrap();
    assert_eq!(summary.mismatches, 0);
    assert_eq!(summary.repaired, 0);
    assert_eq!(summary.blocks_checked, 2);

    let events = super::drain_events(&mut events);
    assert!(
        !events.iter().any(|e| matches!(e, Event::Error { .. })),
        "a clean verify must not report errors, got {events:?}"
    );
}
