#![no_main]

use ember::ingest;
use ember::store::Store;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(records) = ingest::records(data, ingest::Format::Mojo, Default::default()) {
        let store = Store::default();
        ingest::feed(records, &store).ok();
        for snapshot in store.snapshot_all() {
            assert!(snapshot.tree.roots().iter().all(|root| root.own <= root.total));
        }
    }
});
