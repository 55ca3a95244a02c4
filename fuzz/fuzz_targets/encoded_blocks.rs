#![no_main]

use blockcov::module_table::{HostModule, Whitelist};
use blockcov::session::CoverageSession;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let session = match CoverageSession::start(
        &[HostModule::new("a.dll", 0x1000, 0x1000)],
        &Whitelist::All,
        &[],
    ) {
        Ok(session) => session,
        Err(_) => return,
    };

    // Arbitrary payloads are counted or skipped, never fatal
    session.record_encoded(data);
    session.record_raw_pairs(data);
    let stats = session.stats();
    assert!(stats.unique_blocks <= stats.events);

    let rendered = session.render();
    let parsed = blockcov::drcov::parse(&rendered).expect("rendered file parses");
    assert_eq!(parsed.blocks.len() as u64, stats.unique_blocks);
});
