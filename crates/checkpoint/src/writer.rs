use crate::layout::Pos;
use crate::{Error, Result, BLOCK_MAGIC, CRC32, EOF_RECORD_BYTES, SYNC_MARKER};
use byteorder::{BigEndian, ByteOrder};
use protocol::vint;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Writer configuration.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Size of one file block. Every rank of a job must use the same value;
    /// the reader takes it from the header rank 0 writes.
    pub block_size: u32,
    /// Bytes buffered before an automatic write-out.
    pub buffer_size: usize,
    /// Flush (and fsync) every N records. None flushes only on request.
    pub flush_period: Option<u32>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            block_size: 512 * 1024,
            buffer_size: 64 * 1024,
            flush_period: None,
        }
    }
}

/// Writer is one rank's append handle onto the shared checkpoint file.
/// Strictly single-threaded; ranks never write each other's blocks.
pub struct Writer {
    file: File,
    rank: u32,
    ranks: u32,
    block_size: u32,
    buffer_size: usize,
    /// Buffered stream bytes, including block magics, not yet written.
    buf: Vec<u8>,
    /// File position of `buf[0]`.
    start: Pos,
    records_since_flush: u32,
    flush_period: Option<u32>,
}

impl Writer {
    /// Open (never truncating: peer ranks share the file) and position at
    /// this rank's first block. Rank 0 writes the file header.
    pub fn create(path: &Path, rank: u32, ranks: u32, options: Options) -> Result<Writer> {
        if ranks == 0 || rank >= ranks {
            return Err(Error::Invalid(format!("rank {rank} of {ranks}")));
        }
        if options.block_size <= EOF_RECORD_BYTES {
            return Err(Error::Invalid("block size too small".to_owned()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut writer = Writer {
            file,
            rank,
            ranks,
            block_size: options.block_size,
            buffer_size: options.buffer_size.max(1),
            buf: Vec::with_capacity(options.buffer_size.max(1)),
            start: Pos {
                block: rank as u64,
                at: 0,
            },
            records_since_flush: 0,
            flush_period: options.flush_period,
        };
        if rank == 0 {
            let mut header = [0u8; 8];
            BigEndian::write_u32(&mut header[0..4], options.block_size);
            BigEndian::write_u32(&mut header[4..8], ranks);
            writer.append(&header)?;
            // Peers and readers may open the file at any time; the header
            // must already be on disk.
            writer.flush()?;
        }
        tracing::debug!(rank, ranks, block_size = options.block_size, "checkpoint writer open");
        Ok(writer)
    }

    /// Position of the next stream byte to be appended.
    fn cursor(&self) -> Pos {
        self.start
            .advance(self.buf.len() as u64, self.block_size, self.ranks)
    }

    /// Buffer stream bytes, stamping the block magic whenever the cursor
    /// sits at the start of a not-yet-touched block.
    fn append(&mut self, mut data: &[u8]) -> Result<()> {
        loop {
            let mut cursor = self.cursor();
            if cursor.at == 0 {
                self.buf.push(BLOCK_MAGIC);
                cursor.at = 1;
            }
            if data.is_empty() {
                break;
            }
            let room = (self.block_size - cursor.at) as usize;
            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buf.len() >= self.buffer_size {
                self.write_out()?;
            }
            if data.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Write buffered bytes at their physical offsets and advance `start`.
    fn write_out(&mut self) -> Result<()> {
        let mut pos = self.start;
        let mut data = &self.buf[..];
        while !data.is_empty() {
            let room = (self.block_size - pos.at) as usize;
            let n = room.min(data.len());
            self.file
                .write_all_at(&data[..n], pos.offset(self.block_size))?;
            data = &data[n..];
            if n == room {
                pos.block += self.ranks as u64;
                pos.at = 0;
            } else {
                pos.at += n as u32;
            }
        }
        self.start = pos;
        self.buf.clear();
        Ok(())
    }

    /// Append one record. Returns the file offset of the value bytes,
    /// usable with `Reader::read_value_at` (and the in-memory index).
    pub fn write_record(&mut self, key: &[u8], value: &[u8], persist: bool) -> Result<u64> {
        let mut key_len_enc = [0u8; vint::MAX_BYTES];
        let key_len_encb = vint::encode(key.len() as i64, &mut key_len_enc);
        let rec_len = (key_len_encb + key.len() + value.len()) as i64;
        let mut rec_len_enc = [0u8; vint::MAX_BYTES];
        let rec_len_encb = vint::encode(rec_len, &mut rec_len_enc);

        let mut digest = CRC32.digest();
        digest.update(&rec_len_enc[..rec_len_encb]);
        digest.update(&key_len_enc[..key_len_encb]);
        digest.update(key);
        digest.update(value);
        let crc = digest.finalize();

        let mut fixed = [0u8; 8];
        BigEndian::write_u32(&mut fixed[0..4], SYNC_MARKER);
        BigEndian::write_u32(&mut fixed[4..8], crc);
        self.append(&fixed)?;
        self.append(&rec_len_enc[..rec_len_encb])?;
        self.append(&key_len_enc[..key_len_encb])?;
        self.append(key)?;

        // Where the value's first byte will land. A cursor parked exactly
        // on a block boundary still owes that block its magic byte.
        let mut cursor = self.cursor();
        if cursor.at == 0 {
            cursor.at = 1;
        }
        let val_offset = cursor.offset(self.block_size);

        self.append(value)?;

        self.records_since_flush += 1;
        let due = self
            .flush_period
            .is_some_and(|period| self.records_since_flush >= period);
        if persist || due {
            self.flush()?;
        }
        Ok(val_offset)
    }

    /// Force buffered bytes to the file and fsync.
    pub fn flush(&mut self) -> Result<()> {
        self.write_out()?;
        self.file.sync_data()?;
        self.records_since_flush = 0;
        Ok(())
    }

    /// Write the end-of-stream marker when the current block both holds
    /// data and has room for it, then flush. A fresh, untouched block
    /// needs no marker: its zero magic already reads as end-of-stream.
    pub fn close(mut self) -> Result<()> {
        let cursor = self.cursor();
        if cursor.at > 0 && self.block_size - cursor.at >= EOF_RECORD_BYTES {
            let mut zero_enc = [0u8; vint::MAX_BYTES];
            let n = vint::encode(0, &mut zero_enc);
            let mut digest = CRC32.digest();
            digest.update(&zero_enc[..n]);
            let crc = digest.finalize();

            let mut fixed = [0u8; 8];
            BigEndian::write_u32(&mut fixed[0..4], SYNC_MARKER);
            BigEndian::write_u32(&mut fixed[4..8], crc);
            self.append(&fixed)?;
            let enc = zero_enc;
            self.append(&enc[..n])?;
        }
        self.flush()?;
        tracing::debug!(rank = self.rank, "checkpoint writer closed");
        Ok(())
    }

    /// Re-read a value previously written by this rank, by the offset
    /// `write_record` returned. Flushes first so the bytes are visible.
    pub fn read_value(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.write_out()?;
        let mut pos = Pos {
            block: offset / self.block_size as u64,
            at: (offset % self.block_size as u64) as u32,
        };
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            if pos.at == self.block_size {
                pos.block += self.ranks as u64;
                pos.at = 1; // skip the block magic
            }
            let room = (self.block_size - pos.at) as usize;
            let n = room.min(len - filled);
            self.file
                .read_exact_at(&mut out[filled..filled + n], pos.offset(self.block_size))?;
            filled += n;
            pos.at += n as u32;
        }
        Ok(out)
    }
}
