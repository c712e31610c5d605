#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use shipit_store::MemoryStore;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("store.json");
    if fs::write(&path, data).is_ok() {
        let _ = MemoryStore::open(&path);
    }
});
