#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parsing untrusted coverage files must never panic
    if let Ok(file) = blockcov::drcov::parse(data) {
        let _ = file.blocks_per_module();
    }
});
