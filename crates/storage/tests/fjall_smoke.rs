#![cfg(feature = "fjall")]

use std::collections::HashSet;

use hashxd_storage::fjall::FjallStore;
use hashxd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"value".to_vec())
    );

    store.put(Column::History, b"prefix:1", b"a").expect("put");
    store.put(Column::History, b"prefix:2", b"b").expect("put");
    store.put(Column::History, b"prefix:3", b"c").expect("put");
    let mut keys = HashSet::new();
    for (key, value) in store.scan_prefix(Column::History, b"prefix:").expect("scan") {
        keys.insert((key, value));
    }
    assert_eq!(keys.len(), 3);

    let mut ranged = Vec::new();
    store
        .for_each_range(Column::History, b"prefix:1", b"prefix:3", &mut |key, _| {
            ranged.push(key.to_vec());
            Ok(())
        })
        .expect("range");
    assert_eq!(ranged, vec![b"prefix:1".to_vec(), b"prefix:2".to_vec()]);

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"batch", b"ok");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");
    store.persist().expect("persist");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    drop(store);

    let reopened = FjallStore::open(dir.path()).expect("reopen fjall");
    assert_eq!(
        reopened.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}

#[test]
fn fjall_snapshot_pins_all_columns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Utxo, b"a1", b"1").expect("put");
    store.put(Column::Meta, b"state", b"old").expect("put");
    let snapshot = store.snapshot().expect("snapshot");

    let mut batch = WriteBatch::new();
    batch.delete(Column::Utxo, b"a1");
    batch.put(Column::Utxo, b"a2", b"2");
    batch.put(Column::Meta, b"state", b"new");
    store.write_batch(&batch).expect("commit");

    assert_eq!(
        snapshot.get(Column::Meta, b"state").expect("get"),
        Some(b"old".to_vec())
    );
    assert_eq!(
        snapshot.scan_prefix(Column::Utxo, b"a").expect("scan"),
        vec![(b"a1".to_vec(), b"1".to_vec())]
    );
    assert_eq!(
        store.get(Column::Meta, b"state").expect("get"),
        Some(b"new".to_vec())
    );
}
