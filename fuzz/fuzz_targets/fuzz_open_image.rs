#![no_main]
use cluster_store::{Container, StoreConfig};
use libfuzzer_sys::fuzz_target;

// Arbitrary container images must be rejected or read without panicking

fuzz_target!(|data: &[u8]| {
    for recovery in [false, true] {
        let config = StoreConfig {
            recovery,
            ..StoreConfig::read_only()
        };
        let mut store = match Container::from_bytes(data.to_vec(), config) {
            Ok(s) => s,
            Err(_) => continue,
        };

        let _ = store.engine().check_integrity();
        for name in store.list() {
            let _ = store.read(&name);
            let _ = store.len_of(&name);
        }
    }
});
