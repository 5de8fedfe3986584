use super::*;
use crate::codec::record_len;
use tempfile::tempdir;

const DIM: usize = 4;

fn ids(matches: &[Match]) -> Vec<&str> {
    matches.iter().map(|m| m.id.as_str()).collect()
}

fn record_count(path: &Path) -> (usize, usize) {
    let data = fs::read(path).unwrap();
    let mut live = 0;
    let mut dead = 0;
    for record in RecordIter::new(&data, DIM) {
        if record.unwrap().is_live() {
            live += 1;
        } else {
            dead += 1;
        }
    }
    (live, dead)
}

fn header_count(path: &Path) -> u64 {
    let data = fs::read(path).unwrap();
    ShardHeader::decode(&data).unwrap().live_count
}

#[test]
fn new_shard_has_zero_count_header_and_empty_sidecar() {
    let dir = tempdir().unwrap();
    let shard = Shard::open(dir.path(), 2, DIM).unwrap();

    assert_eq!(shard.live_count(), 0);
    assert_eq!(fs::read(shard.path()).unwrap().len(), HEADER_LEN);
    assert_eq!(header_count(shard.path()), 0);
    let meta = fs::read_to_string(dir.path().join("shard_2.meta")).unwrap();
    assert_eq!(meta.trim(), "{}");
}

#[test]
fn upsert_then_search_finds_exact_vector() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("breathe", &[0.9, 0.1, 0.2, 0.3]).unwrap();
    shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();

    let hits = shard.search(&[0.9, 0.1, 0.2, 0.3], 1).unwrap();
    assert_eq!(ids(&hits), vec!["breathe"]);
    assert!(hits[0].distance < 1e-6);
    assert_eq!(header_count(shard.path()), 2);
}

#[test]
fn reupsert_tombstones_previous_record() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("stretch", &[0.1, 0.9, 0.2, 0.1]).unwrap();
    shard.upsert("stretch", &[0.0, 0.0, 0.0, 1.0]).unwrap();

    assert_eq!(shard.live_count(), 1);
    assert_eq!(record_count(shard.path()), (1, 1));
    assert_eq!(
        shard.get("stretch").unwrap(),
        Some(vec![0.0, 0.0, 0.0, 1.0])
    );

    let hits = shard.search(&[0.1, 0.9, 0.2, 0.1], 5).unwrap();
    assert_eq!(hits.len(), 1);
    let expected = crate::distance::l2(&[0.1, 0.9, 0.2, 0.1], &[0.0, 0.0, 0.0, 1.0]);
    assert!((hits[0].distance - expected).abs() < 1e-5);
}

#[test]
fn remove_tombstones_and_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("hydrate", &[0.2, 0.3, 0.8, 0.1]).unwrap();
    let len_before = fs::metadata(shard.path()).unwrap().len();

    assert!(shard.remove("hydrate").unwrap());
    assert!(!shard.remove("hydrate").unwrap());
    assert!(!shard.remove("never-seen").unwrap());

    assert_eq!(shard.live_count(), 0);
    assert_eq!(header_count(shard.path()), 0);
    assert_eq!(fs::metadata(shard.path()).unwrap().len(), len_before);
    assert!(shard.search(&[0.2, 0.3, 0.8, 0.1], 3).unwrap().is_empty());
}

#[test]
fn dimension_mismatch_leaves_file_untouched() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("journal", &[0.5, 0.5, 0.3, 0.2]).unwrap();
    let before = fs::read(shard.path()).unwrap();

    assert!(matches!(
        shard.upsert("journal", &[1.0, 2.0]),
        Err(VectorError::DimensionMismatch { expected: 4, actual: 2 })
    ));
    assert!(matches!(
        shard.search(&[1.0; 5], 1),
        Err(VectorError::DimensionMismatch { expected: 4, actual: 5 })
    ));
    assert_eq!(fs::read(shard.path()).unwrap(), before);
    assert_eq!(shard.get("journal").unwrap(), Some(vec![0.5, 0.5, 0.3, 0.2]));
}

#[test]
fn reopen_restores_offsets() {
    let dir = tempdir().unwrap();
    {
        let mut shard = Shard::open(dir.path(), 1, DIM).unwrap();
        shard.upsert("breathe", &[0.9, 0.1, 0.2, 0.3]).unwrap();
        shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();
        shard.remove("walk").unwrap();
    }

    let shard = Shard::open(dir.path(), 1, DIM).unwrap();
    assert_eq!(shard.live_count(), 1);
    assert_eq!(shard.get("breathe").unwrap(), Some(vec![0.9, 0.1, 0.2, 0.3]));
    assert_eq!(shard.get("walk").unwrap(), None);
}

#[test]
fn corrupted_magic_fails_open() {
    let dir = tempdir().unwrap();
    let path = {
        let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
        shard.upsert("breathe", &[0.9, 0.1, 0.2, 0.3]).unwrap();
        shard.path().to_path_buf()
    };
    let mut data = fs::read(&path).unwrap();
    data[0..4].copy_from_slice(b"JUNK");
    fs::write(&path, data).unwrap();

    assert!(matches!(
        Shard::open(dir.path(), 0, DIM),
        Err(VectorError::CorruptShard { .. })
    ));
}

#[test]
fn unknown_version_and_wrong_dimension_fail_open() {
    let dir = tempdir().unwrap();
    let path = Shard::open(dir.path(), 0, DIM).unwrap().path().to_path_buf();

    assert!(matches!(
        Shard::open(dir.path(), 0, 8),
        Err(VectorError::CorruptShard { .. })
    ));

    let mut data = fs::read(&path).unwrap();
    data[4..6].copy_from_slice(&2u16.to_le_bytes());
    fs::write(&path, data).unwrap();
    assert!(matches!(
        Shard::open(dir.path(), 0, DIM),
        Err(VectorError::CorruptShard { .. })
    ));
}

#[test]
fn truncated_record_is_reported_on_search() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();

    let file = OpenOptions::new().write(true).open(shard.path()).unwrap();
    file.set_len((HEADER_LEN + record_len(4, DIM) - 3) as u64).unwrap();
    drop(file);

    assert!(matches!(
        shard.search(&[0.0; DIM], 1),
        Err(VectorError::CorruptShard { .. })
    ));
}

#[test]
fn missing_sidecar_is_rebuilt_from_records() {
    let dir = tempdir().unwrap();
    {
        let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
        shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();
        shard.upsert("walk", &[0.4, 0.2, 0.1, 0.9]).unwrap();
        shard.upsert("journal", &[0.5, 0.5, 0.3, 0.2]).unwrap();
    }
    let meta_path = dir.path().join(meta_file_name(0));
    fs::remove_file(&meta_path).unwrap();

    let shard = Shard::open(dir.path(), 0, DIM).unwrap();
    assert_eq!(shard.live_count(), 2);
    assert_eq!(shard.get("walk").unwrap(), Some(vec![0.4, 0.2, 0.1, 0.9]));
    let hits = shard.search(&[0.4, 0.2, 0.1, 0.9], 5).unwrap();
    assert_eq!(ids(&hits), vec!["walk", "journal"]);

    let reloaded = ShardMeta::load(&meta_path).unwrap().unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.get("walk"), shard.meta.get("walk"));
}

#[test]
fn stale_sidecar_after_reupsert_serves_the_newest_vector() {
    let dir = tempdir().unwrap();
    let meta_path = dir.path().join(meta_file_name(0));
    {
        let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
        shard.upsert("breathe", &[0.9, 0.1, 0.2, 0.3]).unwrap();
    }
    let stale = fs::read(&meta_path).unwrap();
    {
        let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
        shard.upsert("breathe", &[0.1, 0.1, 0.1, 0.1]).unwrap();
    }
    // Crash after the shard sync, before the sidecar landed.
    fs::write(&meta_path, stale).unwrap();
    assert_eq!(record_count(&dir.path().join(shard_file_name(0))), (1, 1));

    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    assert_eq!(shard.live_count(), 1);
    assert_eq!(header_count(shard.path()), 1);
    assert_eq!(shard.get("breathe").unwrap(), Some(vec![0.1, 0.1, 0.1, 0.1]));
    let hits = shard.search(&[0.1, 0.1, 0.1, 0.1], 5).unwrap();
    assert_eq!(ids(&hits), vec!["breathe"]);
    assert!(hits[0].distance < 1e-6);

    // Later writes tombstone the newest record, not the stale one.
    shard.upsert("breathe", &[0.2, 0.2, 0.2, 0.2]).unwrap();
    assert_eq!(record_count(shard.path()), (1, 2));
    assert_eq!(ids(&shard.search(&[0.1, 0.1, 0.1, 0.1], 5).unwrap()), vec!["breathe"]);
}

#[test]
fn stale_sidecar_after_remove_drops_the_id() {
    let dir = tempdir().unwrap();
    let meta_path = dir.path().join(meta_file_name(0));
    let stale = {
        let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
        shard.upsert("hydrate", &[0.2, 0.3, 0.8, 0.1]).unwrap();
        shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();
        let stale = fs::read(&meta_path).unwrap();
        shard.remove("hydrate").unwrap();
        stale
    };
    fs::write(&meta_path, stale).unwrap();

    let shard = Shard::open(dir.path(), 0, DIM).unwrap();
    assert_eq!(shard.live_count(), 1);
    assert_eq!(shard.get("hydrate").unwrap(), None);
    assert_eq!(ids(&shard.search(&[0.2, 0.3, 0.8, 0.1], 5).unwrap()), vec!["walk"]);
}

#[test]
fn search_and_compaction_keep_records_missing_from_sidecar() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("breathe", &[0.9, 0.1, 0.2, 0.3]).unwrap();
    shard.upsert("stretch", &[0.1, 0.9, 0.2, 0.1]).unwrap();
    shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();
    shard.remove("walk").unwrap();
    shard.meta.remove("stretch");

    let hits = shard.search(&[0.1, 0.9, 0.2, 0.1], 1).unwrap();
    assert_eq!(ids(&hits), vec!["stretch"]);

    assert!(shard.compact().unwrap());
    assert_eq!(record_count(shard.path()), (2, 0));
    assert_eq!(shard.live_count(), 2);
    assert_eq!(shard.get("stretch").unwrap(), Some(vec![0.1, 0.9, 0.2, 0.1]));
    assert_eq!(header_count(shard.path()), 2);
}

fn lost_device(_: File) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Other, "device lost"))
}

#[test]
fn close_failure_after_successful_write_is_an_io_error() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();

    let err = shard
        .with_writer_closed_by("rewrite live count", lost_device, |shard, file| {
            shard.write_live_count(file)
        })
        .unwrap_err();
    match err {
        VectorError::Io { op, source, path } => {
            assert_eq!(op, "close shard");
            assert_eq!(source.to_string(), "device lost");
            assert_eq!(path, shard.path());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn failed_write_and_failed_close_report_both_causes() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();

    let err = shard
        .with_writer_closed_by("upsert", lost_device, |shard, _| {
            Err::<(), _>(VectorError::io(
                &shard.path,
                "append record",
                io::Error::new(io::ErrorKind::Other, "disk full"),
            ))
        })
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("disk full"), "{message}");
    assert!(message.contains("device lost"), "{message}");

    match err {
        VectorError::CloseFailed { op, source, close, .. } => {
            assert_eq!(op, "upsert");
            assert!(matches!(*source, VectorError::Io { op: "append record", .. }));
            assert_eq!(close.to_string(), "device lost");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn failed_write_with_clean_close_keeps_the_original_error() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();

    let err = shard
        .with_writer("upsert", |_, _| Err::<(), _>(VectorError::InvalidId("too long".into())))
        .unwrap_err();
    assert!(matches!(err, VectorError::InvalidId(_)));
}

#[test]
fn compaction_drops_dead_records_and_keeps_results() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("breathe", &[0.9, 0.1, 0.2, 0.3]).unwrap();
    shard.upsert("stretch", &[0.1, 0.9, 0.2, 0.1]).unwrap();
    shard.upsert("breathe", &[0.8, 0.2, 0.2, 0.3]).unwrap();
    shard.remove("stretch").unwrap();
    shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();

    let query = [0.8, 0.2, 0.3, 0.2];
    let before = shard.search(&query, 5).unwrap();
    let size_before = fs::metadata(shard.path()).unwrap().len();

    assert!(shard.compact().unwrap());
    assert!(!shard.compact().unwrap());

    assert!(fs::metadata(shard.path()).unwrap().len() < size_before);
    assert_eq!(record_count(shard.path()), (2, 0));
    assert_eq!(shard.search(&query, 5).unwrap(), before);
    assert!(!dir.path().join(pending_meta_name(0)).exists());

    let reopened = Shard::open(dir.path(), 0, DIM).unwrap();
    assert_eq!(reopened.search(&query, 5).unwrap(), before);
    assert_eq!(header_count(reopened.path()), 2);
}

#[test]
fn interrupted_compaction_is_completed_on_open() {
    let dir = tempdir().unwrap();
    let query = [0.3, 0.2, 0.1, 0.9];
    let expected = {
        let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
        shard.upsert("walk", &[0.1, 0.1, 0.1, 0.1]).unwrap();
        shard.upsert("walk", &query).unwrap();
        shard.compact().unwrap();
        shard.search(&query, 1).unwrap()
    };

    // Shard swapped, sidecar rename lost: the pending file holds the truth.
    let meta_path = dir.path().join(meta_file_name(0));
    let pending = dir.path().join(pending_meta_name(0));
    fs::copy(&meta_path, &pending).unwrap();
    fs::write(&meta_path, br#"{"walk":999}"#).unwrap();

    let shard = Shard::open(dir.path(), 0, DIM).unwrap();
    assert!(!pending.exists());
    assert_eq!(shard.search(&query, 1).unwrap(), expected);
}

#[test]
fn zero_top_k_returns_nothing() {
    let dir = tempdir().unwrap();
    let mut shard = Shard::open(dir.path(), 0, DIM).unwrap();
    shard.upsert("walk", &[0.3, 0.2, 0.1, 0.9]).unwrap();
    assert!(shard.search(&[0.3, 0.2, 0.1, 0.9], 0).unwrap().is_empty());
}
