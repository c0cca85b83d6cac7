use crate::{Index, IndexEntry, Options, Result, Writer};
use bytes::Bytes;
use std::path::Path;

/// Log couples one rank's [`Writer`] with the in-memory [`Index`], so a
/// checkpoint written moments ago can be consulted without replaying the
/// file. Values up to `inline_max` are kept inline; larger ones are
/// indexed by their file location and re-read on demand.
pub struct Log {
    writer: Writer,
    index: Index,
    inline_max: usize,
}

impl Log {
    pub fn create(
        path: &Path,
        rank: u32,
        ranks: u32,
        options: Options,
        index_entries: usize,
        inline_max: usize,
    ) -> Result<Log> {
        Ok(Log {
            writer: Writer::create(path, rank, ranks, options)?,
            index: Index::new(index_entries),
            inline_max,
        })
    }

    /// Append a record and remember where its value went.
    pub fn store(&mut self, key: &[u8], value: &[u8], persist: bool) -> Result<()> {
        let offset = self.writer.write_record(key, value, persist)?;
        let entry = if value.len() <= self.inline_max {
            IndexEntry::Inline(Bytes::copy_from_slice(value))
        } else {
            IndexEntry::Located {
                offset,
                len: value.len(),
            }
        };
        self.index.add(Bytes::copy_from_slice(key), entry);
        Ok(())
    }

    /// The value last stored under `key`, if it is still indexed:
    /// straight from memory when inline, re-read from the file when not.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.index.lookup(key) {
            None => Ok(None),
            Some(IndexEntry::Inline(bytes)) => Ok(Some(bytes.clone())),
            Some(&IndexEntry::Located { offset, len }) => {
                let bytes = self.writer.read_value(offset, len)?;
                Ok(Some(bytes.into()))
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }

    pub fn close(self) -> Result<()> {
        self.writer.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_serves_inline_and_file_backed_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xpt");
        let options = Options {
            block_size: 1024,
            buffer_size: 128,
            flush_period: None,
        };
        let mut log = Log::create(&path, 0, 1, options, 64, 256).unwrap();

        let big: Vec<u8> = (0..3000u64).map(|i| (i % 97) as u8).collect();
        log.store(b"small", b"payload", false).unwrap();
        log.store(b"big", &big, false).unwrap();

        assert_eq!(log.lookup(b"small").unwrap().unwrap().as_ref(), b"payload");
        assert_eq!(log.lookup(b"big").unwrap().unwrap().as_ref(), &big[..]);
        assert_eq!(log.lookup(b"absent").unwrap(), None);
    }

    #[test]
    fn evicted_keys_stop_resolving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xpt");
        let mut log = Log::create(&path, 0, 1, Options::default(), 1, 256).unwrap();

        log.store(b"first", b"one", false).unwrap();
        log.store(b"second", b"two", false).unwrap();

        assert_eq!(log.lookup(b"first").unwrap(), None);
        assert_eq!(log.lookup(b"second").unwrap().unwrap().as_ref(), b"two");
    }
}
