//! Integration tests for DRCOV file output
//!
//! These exercise the full pipeline: module table, resolution, coverage set
//! and finalize, checking the written bytes.

use blockcov::drcov::{self, CoverageFile};
use blockcov::module_table::{CustomRegion, HostModule, Whitelist};
use blockcov::resolver::BlockEvent;
use blockcov::session::CoverageSession;

fn split_at_bb_table(bytes: &[u8]) -> (&str, &[u8]) {
    let marker = b"BB Table: ";
    let pos = bytes
        .windows(marker.len())
        .position(|w| w == marker)
        .expect("BB Table line present");
    let newline = pos + bytes[pos..].iter().position(|&b| b == b'\n').unwrap();
    (
        std::str::from_utf8(&bytes[..=newline]).unwrap(),
        &bytes[newline + 1..],
    )
}

#[test]
fn test_single_module_duplicate_block_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drcov.log");

    let session = CoverageSession::start(
        &[HostModule::new("a.dll", 0x1000, 0x1000)],
        &Whitelist::All,
        &[],
    )
    .unwrap();
    session.record(BlockEvent::new(0x1050, 0x1060));
    session.record(BlockEvent::new(0x1050, 0x1060));
    session.finalize(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let expected_header = "DRCOV VERSION: 2\n\
                           DRCOV FLAVOR: frida\n\
                           Module Table: version 2, count 1\n\
                           Columns: id, base, end, entry, checksum, timestamp, path\n\
                           0, 4096, 8192, 0, 0, 0, a.dll\n\
                           BB Table: 1 bbs\n";
    let (text, payload) = split_at_bb_table(&bytes);
    assert_eq!(text, expected_header);
    assert_eq!(payload, &[0x50, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00]);
}

#[test]
fn test_unresolved_block_leaves_empty_table() {
    let session = CoverageSession::start(
        &[HostModule::new("a.dll", 0x1000, 0x1000)],
        &Whitelist::All,
        &[],
    )
    .unwrap();
    session.record(BlockEvent::new(0x5000, 0x5010));

    let bytes = session.render();
    let (text, payload) = split_at_bb_table(&bytes);
    assert!(text.ends_with("BB Table: 0 bbs\n"));
    assert!(payload.is_empty());
}

#[test]
fn test_second_module_record_bytes() {
    let session = CoverageSession::start(
        &[
            HostModule::new("a.dll", 0x1000, 0x1000),
            HostModule::new("b.dll", 0x40_0000, 0x1000),
        ],
        &Whitelist::All,
        &[],
    )
    .unwrap();
    session.record(BlockEvent::new(0x40_0200, 0x40_0204));

    let rendered = session.render();
    let (_, payload) = split_at_bb_table(&rendered);
    assert_eq!(payload, &[0x00, 0x02, 0x00, 0x00, 0x04, 0x00, 0x01, 0x00]);
}

#[test]
fn test_header_counts_match_body() {
    let session = CoverageSession::start(
        &[
            HostModule::new("main", 0x40_0000, 0x1_0000).with_path("/usr/bin/main"),
            HostModule::new("libc.so.6", 0x7f00_0000_0000, 0x20_0000)
                .with_path("/lib/x86_64-linux-gnu/libc.so.6"),
        ],
        &Whitelist::All,
        &[CustomRegion::new(0x1000_0000, 0x1000, "jit-region")],
    )
    .unwrap()
    .with_flavor("blockcov")
    .unwrap();

    for i in 0..50u64 {
        session.record(BlockEvent::new(0x40_0000 + i * 16, 0x40_0000 + i * 16 + 7));
        session.record(BlockEvent::new(0x7f00_0000_0000 + i * 32, 0x7f00_0000_0000 + i * 32 + 3));
    }
    session.record(BlockEvent::new(0x1000_0010, 0x1000_0020));

    let bytes = session.render();
    let file = drcov::parse(&bytes).unwrap();
    assert_eq!(file.flavor, "blockcov");
    assert_eq!(file.modules.len(), 3);
    assert_eq!(file.modules[2].path, "jit-region");
    assert_eq!(file.blocks.len(), 101);
    assert_eq!(file.blocks_per_module(), vec![50, 50, 1]);

    let (text, payload) = split_at_bb_table(&bytes);
    assert!(text.contains("Module Table: version 2, count 3\n"));
    assert!(text.ends_with("BB Table: 101 bbs\n"));
    assert_eq!(payload.len(), 101 * 8);
}

#[test]
fn test_whitelist_shapes_header_and_ids() {
    let host = vec![
        HostModule::new("skip.dll", 0x1000, 0x1000),
        HostModule::new("keep.dll", 0x8000, 0x1000),
    ];
    let session =
        CoverageSession::start(&host, &Whitelist::from_names(["keep.dll"]), &[]).unwrap();

    session.record(BlockEvent::new(0x1010, 0x1020)); // untracked module
    session.record(BlockEvent::new(0x8010, 0x8020));

    let file = drcov::parse(&session.render()).unwrap();
    assert_eq!(file.modules.len(), 1);
    assert_eq!(file.modules[0].path, "keep.dll");
    assert_eq!(file.blocks.len(), 1);
    assert_eq!(file.blocks[0].module_id, 0);
    assert_eq!(file.blocks[0].offset, 0x10);
    assert_eq!(session.stats().unresolved, 1);
}

#[test]
fn test_finalize_replaces_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cov.drcov");
    std::fs::write(&path, vec![0xAA; 4096]).unwrap();

    let session = CoverageSession::start(
        &[HostModule::new("a.dll", 0x1000, 0x1000)],
        &Whitelist::All,
        &[],
    )
    .unwrap();
    session.record(BlockEvent::new(0x1000, 0x1004));
    let report = session.finalize(&path).unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), report.bytes);
    assert!(written.starts_with(b"DRCOV VERSION: 2\n"));
    assert_eq!(CoverageFile::from_file(&path).unwrap().blocks.len(), 1);
}

#[test]
fn test_snapshot_order_stable_across_insert_order() {
    let host = [HostModule::new("a.dll", 0x1000, 0x1000)];
    let forward = CoverageSession::start(&host, &Whitelist::All, &[]).unwrap();
    let backward = CoverageSession::start(&host, &Whitelist::All, &[]).unwrap();

    let events: Vec<BlockEvent> = (0..200u64)
        .map(|i| BlockEvent::new(0x1000 + i * 4, 0x1000 + i * 4 + 2))
        .collect();
    forward.record_events(&events);
    let reversed: Vec<BlockEvent> = events.iter().rev().copied().collect();
    backward.record_events(&reversed);

    assert_eq!(forward.render(), backward.render());
}
