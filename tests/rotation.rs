//! Rotation by size: file switch, rotate event, index contents, and
//! the prepared-XID gate.

mod common;

use std::path::Path;

use replog::event::{payload, EventType};
use replog::log::is_in_use;
use replog::{LogConfig, Session, TcLog};
use tempfile::TempDir;

use common::{read_events, stage_insert};

fn tiny_log_config() -> LogConfig {
    let config = LogConfig::new(3);
    // Any complete transaction pushes the file past this.
    config.set_max_log_size(100);
    config
}

#[test]
fn test_two_transactions_two_files() {
    let dir = TempDir::new().unwrap();
    let log = common::open_plain(dir.path(), tiny_log_config());
    let session = Session::new(1);

    stage_insert(&log, &session, "INSERT INTO t VALUES (1)");
    let c1 = log.log_xid(&session, 1, None).unwrap();
    log.unlog(&session, c1, 1).unwrap(); // rotates: file 1 is past max

    stage_insert(&log, &session, "INSERT INTO t VALUES (2)");
    let c2 = log.log_xid(&session, 2, None).unwrap();
    log.unlog(&session, c2, 2).unwrap();

    let entries = log.index_entries().unwrap();
    assert!(entries.len() >= 2);
    assert!(entries[0].ends_with("log.000001"));
    assert!(entries[1].ends_with("log.000002"));

    // File 1 ends with a rotate event naming file 2 and has a clear
    // in-use flag.
    let first = Path::new(&entries[0]);
    assert!(!is_in_use(first).unwrap());
    let events = read_events(first);
    let last = events.last().unwrap();
    assert_eq!(last.header.event_type, EventType::Rotate);
    let rotate = payload::Rotate::decode(&last.payload).unwrap();
    assert_eq!(rotate.next_file, "log.000002");
    assert_eq!(rotate.position, 4);

    // File 2 carries the second transaction.
    let second = read_events(Path::new(&entries[1]));
    let xids: Vec<u64> = second
        .iter()
        .filter(|e| e.header.event_type == EventType::Xid)
        .map(|e| payload::decode_xid(&e.payload).unwrap())
        .collect();
    assert_eq!(xids, vec![2]);
}

#[test]
fn test_rotation_blocks_while_prepared_xids_outstanding() {
    let dir = TempDir::new().unwrap();
    let log = common::open_plain(dir.path(), tiny_log_config());
    let session = Session::new(1);

    stage_insert(&log, &session, "INSERT INTO t VALUES (1)");
    let cookie = log.log_xid(&session, 9, None).unwrap();
    assert_eq!(log.prepared_xids(), 1);

    // The file is past the size threshold, but rotation must wait for
    // the unlog, so the active file is still the first one.
    let before = log.active_log().unwrap();
    assert!(before.ends_with("log.000001"));

    log.unlog(&session, cookie, 9).unwrap();
    assert_eq!(log.prepared_xids(), 0);

    let after = log.active_log().unwrap();
    assert!(after.ends_with("log.000002"));
}

#[test]
fn test_every_retired_file_is_cleanly_closed() {
    let dir = TempDir::new().unwrap();
    let log = common::open_plain(dir.path(), tiny_log_config());
    let session = Session::new(1);

    for xid in 1..=4u64 {
        stage_insert(&log, &session, "INSERT INTO t VALUES (0)");
        let cookie = log.log_xid(&session, xid, None).unwrap();
        log.unlog(&session, cookie, xid).unwrap();
    }

    let entries = log.index_entries().unwrap();
    let active = log.active_log().unwrap();
    assert!(entries.len() >= 4);

    // Every non-active indexed file: magic fine, in-use clear, final
    // event parseable.
    for entry in entries.iter().filter(|e| **e != active) {
        let path = Path::new(entry);
        assert!(!is_in_use(path).unwrap(), "{} still in use", entry);
        let events = read_events(path);
        assert!(!events.is_empty());
    }
    assert_eq!(log.metrics().rotations(), 4);
}

#[test]
fn test_below_threshold_no_rotation() {
    let dir = TempDir::new().unwrap();
    let log = common::open_plain(dir.path(), LogConfig::new(3));
    let session = Session::new(1);

    stage_insert(&log, &session, "INSERT INTO t VALUES (1)");
    let cookie = log.log_xid(&session, 1, None).unwrap();
    log.unlog(&session, cookie, 1).unwrap();

    assert_eq!(log.index_entries().unwrap().len(), 1);
    assert!(!log.rotate_and_purge().unwrap());
}

#[test]
fn test_forced_rotate_and_purge_honors_threshold() {
    let dir = TempDir::new().unwrap();
    let log = common::open_plain(dir.path(), tiny_log_config());
    let session = Session::new(1);

    // Cross the threshold without an XID: a plain COMMIT rotates on
    // its own flush path.
    session.begin_transaction();
    stage_insert(&log, &session, "INSERT INTO t VALUES (1)");
    log.commit(&session, true).unwrap();
    session.end_transaction();

    let entries = log.index_entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(log.active_log().unwrap().ends_with("log.000002"));
}
