use checkpoint::{reload, Options, ReadOutcome, Reader, Writer};
use std::collections::HashMap;
use std::path::Path;

const BLOCK: u32 = 4096;
const RANKS: u32 = 4;
const RECORDS: u64 = 1000;

fn options() -> Options {
    Options {
        block_size: BLOCK,
        buffer_size: 512,
        flush_period: None,
    }
}

fn key_of(rank: u32, i: u64) -> [u8; 8] {
    (rank as u64 * 1000 + i).to_le_bytes()
}

/// Mixed sizes: every tenth value is larger than a block, so it must
/// span the rank's (non-contiguous) block chain.
fn value_of(i: u64) -> Vec<u8> {
    let len = if i % 10 == 0 { 10_000 } else { 128 };
    (0..len).map(|j| ((i + j) % 251) as u8).collect()
}

fn write_four_rank_file(path: &Path) {
    let mut writers: Vec<Writer> = (0..RANKS)
        .map(|rank| Writer::create(path, rank, RANKS, options()).unwrap())
        .collect();
    for i in 0..RECORDS {
        for (rank, writer) in writers.iter_mut().enumerate() {
            writer
                .write_record(&key_of(rank as u32, i), &value_of(i), false)
                .unwrap();
        }
    }
    for writer in writers {
        writer.close().unwrap();
    }
}

fn reload_tally(path: &Path) -> (Vec<checkpoint::RankStats>, HashMap<Vec<u8>, Vec<u8>>) {
    let mut seen = HashMap::new();
    let stats = reload(path, |_rank, record| {
        seen.insert(record.key.to_vec(), record.value.to_vec());
        true
    })
    .unwrap();
    (stats, seen)
}

#[test]
fn four_ranks_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");
    write_four_rank_file(&path);

    let (stats, seen) = reload_tally(&path);
    assert_eq!(stats.len(), RANKS as usize);
    for s in &stats {
        assert_eq!((s.valid, s.invalid, s.truncated), (RECORDS, 0, 0), "rank {}", s.rank);
    }
    for rank in 0..RANKS {
        for i in 0..RECORDS {
            let got = seen
                .get(&key_of(rank, i)[..])
                .unwrap_or_else(|| panic!("missing record {rank}/{i}"));
            assert_eq!(got, &value_of(i), "value mismatch at {rank}/{i}");
        }
    }
}

#[test]
fn truncated_tail_loses_at_most_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");
    write_four_rank_file(&path);

    let size = std::fs::metadata(&path).unwrap().len();
    let cut = size - 50;
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(cut).unwrap();

    // Ranks owning blocks past the cut lose their tail; everyone else
    // must be untouched.
    let affected: Vec<u32> = (cut / BLOCK as u64..=(size - 1) / BLOCK as u64)
        .map(|block| (block % RANKS as u64) as u32)
        .collect();

    let (stats, _) = reload_tally(&path);
    for s in &stats {
        if affected.contains(&s.rank) {
            assert!(s.valid >= RECORDS - 1, "rank {} lost too much", s.rank);
            assert!(s.invalid + s.truncated <= 1, "rank {}", s.rank);
            assert!(
                s.valid == RECORDS || s.invalid + s.truncated == 1,
                "rank {} neither intact nor marked torn",
                s.rank
            );
        } else {
            assert_eq!((s.valid, s.invalid, s.truncated), (RECORDS, 0, 0), "rank {}", s.rank);
        }
    }
}

#[test]
fn corrupt_record_is_skipped_and_the_stream_resyncs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");

    let mut offsets = Vec::new();
    let mut writer = Writer::create(
        &path,
        0,
        1,
        Options {
            block_size: 1024,
            buffer_size: 128,
            flush_period: None,
        },
    )
    .unwrap();
    for i in 0..100u64 {
        let offset = writer
            .write_record(&i.to_le_bytes(), &value_of(i)[..64], false)
            .unwrap();
        offsets.push(offset);
    }
    writer.close().unwrap();

    // Flip one byte inside record 50's value.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[offsets[50] as usize] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let mut keys = Vec::new();
    let stats = reload(&path, |_rank, record| {
        keys.push(u64::from_le_bytes(record.key.as_ref().try_into().unwrap()));
        true
    })
    .unwrap();
    assert_eq!((stats[0].valid, stats[0].invalid, stats[0].truncated), (99, 1, 0));
    // Everything after the corrupt record was recovered.
    assert!(!keys.contains(&50));
    assert!(keys.contains(&51));
    assert!(keys.contains(&99));
}

#[test]
fn record_may_fill_the_block_to_one_byte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");

    // Block 128, header 9: 119 bytes remain. sync(4) + crc(4) +
    // vint(108)=2 + rec_len 108 = 118, leaving exactly one byte.
    let key = [7u8];
    let value = vec![3u8; 106];
    let mut writer = Writer::create(
        &path,
        0,
        1,
        Options {
            block_size: 128,
            buffer_size: 32,
            flush_period: None,
        },
    )
    .unwrap();
    writer.write_record(&key, &value, false).unwrap();
    // No room for an end-of-stream marker: close must not start a block.
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert!(reader.select_rank(0).unwrap());
    match reader.read_record().unwrap() {
        ReadOutcome::Record(record) => {
            assert_eq!(record.key.as_ref(), &key);
            assert_eq!(record.value.as_ref(), &value[..]);
        }
        other => panic!("expected a record, got {other:?}"),
    }
    assert_eq!(reader.read_record().unwrap(), ReadOutcome::EndOfRank);
}

#[test]
fn close_writes_a_marker_into_exactly_fitting_space() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");

    // 119 bytes remain; record takes 110, leaving exactly the 9 bytes an
    // end-of-stream marker needs.
    let key = [7u8];
    let value = vec![3u8; 98];
    let mut writer = Writer::create(
        &path,
        0,
        1,
        Options {
            block_size: 128,
            buffer_size: 32,
            flush_period: None,
        },
    )
    .unwrap();
    writer.write_record(&key, &value, false).unwrap();
    writer.close().unwrap();

    // The marker makes the end explicit.
    let mut reader = Reader::open(&path).unwrap();
    assert!(reader.select_rank(0).unwrap());
    assert!(matches!(reader.read_record().unwrap(), ReadOutcome::Record(_)));
    assert_eq!(reader.read_record().unwrap(), ReadOutcome::EndOfRank);
}

#[test]
fn values_spanning_blocks_read_back_by_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");
    let options = Options {
        block_size: 1024,
        buffer_size: 256,
        flush_period: None,
    };

    let mut rank0 = Writer::create(&path, 0, 2, options).unwrap();
    let mut rank1 = Writer::create(&path, 1, 2, options).unwrap();

    let value: Vec<u8> = (0..3000u64).map(|i| (i % 241) as u8).collect();
    let offset = rank1.write_record(b"wide", &value, true).unwrap();

    // The writer can read its own flushed value back.
    assert_eq!(rank1.read_value(offset, value.len()).unwrap(), value);

    rank0.write_record(b"other", b"short", false).unwrap();
    rank0.close().unwrap();
    rank1.close().unwrap();

    // So can a reader, both via the record walk and by raw offset.
    let mut reader = Reader::open(&path).unwrap();
    assert!(reader.select_rank(1).unwrap());
    match reader.read_record().unwrap() {
        ReadOutcome::Record(record) => {
            assert_eq!(record.val_offset, offset);
            assert_eq!(record.value.as_ref(), &value[..]);
        }
        other => panic!("expected a record, got {other:?}"),
    }
    assert_eq!(reader.read_value_at(offset, value.len()).unwrap(), value);
}

#[test]
fn empty_rank_streams_read_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpt");

    let rank0 = Writer::create(&path, 0, 3, options()).unwrap();
    let mut rank2 = Writer::create(&path, 2, 3, options()).unwrap();
    rank2.write_record(b"k", b"v", false).unwrap();
    rank0.close().unwrap();
    rank2.close().unwrap();

    let (stats, _) = reload_tally(&path);
    assert_eq!(stats[0].valid, 0);
    assert_eq!(stats[1].valid, 0);
    assert_eq!(stats[2].valid, 1);
}
