//! Checkpoint reload into the data store, across a changed server count.

use bytes::Bytes;
use checkpoint::{Options, Writer};
use datastore::Store;
use protocol::value::{DataType, Value};
use protocol::RetrieveMode;
use runtime::{recover, Decoded};

fn decode(key: &[u8], value: &[u8]) -> Option<Decoded> {
    let id = i64::from_le_bytes(key.try_into().ok()?);
    Some(Decoded {
        id,
        data_type: DataType::Integer,
        bytes: Bytes::copy_from_slice(value),
    })
}

#[test]
fn two_rank_checkpoint_reloads_into_one_server() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");
    let options = Options {
        block_size: 2048,
        buffer_size: 256,
        flush_period: None,
    };

    // A previous two-server job checkpointed ids 10..30, evens on rank 0
    // and odds on rank 1.
    let mut writers: Vec<Writer> = (0..2)
        .map(|rank| Writer::create(&path, rank, 2, options).unwrap())
        .collect();
    for id in 10i64..30 {
        let value = Value::Integer(id * 100).encode();
        writers[(id % 2) as usize]
            .write_record(&id.to_le_bytes(), &value, false)
            .unwrap();
    }
    for writer in writers {
        writer.close().unwrap();
    }

    // Today's job has a single server; it owns everything.
    let mut store = Store::new(0, 1);
    let stats = recover(&mut store, &path, decode).unwrap();
    assert_eq!(stats.len(), 2, "the file's rank count drives the walk");
    assert_eq!(stats.iter().map(|s| s.valid).sum::<u64>(), 20);
    assert_eq!(stats.iter().map(|s| s.invalid + s.truncated).sum::<u64>(), 0);

    for id in 10i64..30 {
        let (data_type, bytes) = store.retrieve(id, None, RetrieveMode::NoRc).unwrap();
        assert_eq!(Value::decode(data_type, &bytes).unwrap(), Value::Integer(id * 100));
    }
    // Restored data is permanent: read decrements don't destroy it.
    for _ in 0..3 {
        store.retrieve(10, None, RetrieveMode::ReadRc).unwrap();
    }
}

#[test]
fn one_rank_checkpoint_splits_across_two_servers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");

    let mut writer = Writer::create(&path, 0, 1, Options::default()).unwrap();
    for id in 2i64..12 {
        writer
            .write_record(&id.to_le_bytes(), &Value::Integer(id).encode(), false)
            .unwrap();
    }
    writer.close().unwrap();

    let mut even = Store::new(0, 2);
    let mut odd = Store::new(1, 2);
    recover(&mut even, &path, decode).unwrap();
    recover(&mut odd, &path, decode).unwrap();

    for id in 2i64..12 {
        let (own, other) = if id % 2 == 0 {
            (&mut even, &mut odd)
        } else {
            (&mut odd, &mut even)
        };
        assert!(own.retrieve(id, None, RetrieveMode::NoRc).is_ok());
        assert!(other.retrieve(id, None, RetrieveMode::NoRc).is_err());
    }
}

#[test]
fn undecodable_records_count_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");

    let mut writer = Writer::create(&path, 0, 1, Options::default()).unwrap();
    writer.write_record(b"bad-key", b"whatever", false).unwrap();
    writer
        .write_record(&7i64.to_le_bytes(), &Value::Integer(7).encode(), false)
        .unwrap();
    writer.close().unwrap();

    let mut store = Store::new(0, 1);
    let stats = recover(&mut store, &path, decode).unwrap();
    assert_eq!((stats[0].valid, stats[0].invalid), (1, 1));
}
