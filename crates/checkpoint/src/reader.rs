use crate::layout::Pos;
use crate::{Error, Result, BLOCK_MAGIC, CRC32, HEADER_BYTES, SYNC_MARKER};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use protocol::vint;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Largest record length the reader will believe. A claimed length beyond
/// this is treated as corruption rather than an allocation request.
const MAX_RECORD_LEN: i64 = 1 << 40;

/// One decoded checkpoint record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    /// File offset of the value bytes, as `Writer::write_record` reported.
    pub val_offset: u64,
}

/// The outcome of one `read_record` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Record(Record),
    /// The rank's stream ended cleanly: an end-of-stream marker, an
    /// untouched block, or end of file at a record boundary.
    EndOfRank,
    /// A record failed its CRC or decoded nonsense. The reader has
    /// resynchronised on the next sync marker.
    Corrupt,
    /// The stream ended mid-record: a torn write from a crash.
    Truncated,
}

/// Reader walks one rank's stream of a checkpoint file at a time.
/// Reload iterates the *file's* rank count, so a checkpoint written by R
/// servers reloads into a job of any size.
pub struct Reader {
    file: File,
    block_size: u32,
    ranks: u32,
    pos: Pos,
    end_of_stream: bool,
}

impl Reader {
    /// Open and validate the header of block 0.
    pub fn open(path: &Path) -> Result<Reader> {
        let file = File::open(path)?;
        let mut header = [0u8; HEADER_BYTES as usize];
        file.read_exact_at(&mut header, 0)
            .map_err(|_| Error::Corrupted)?;
        if header[0] != BLOCK_MAGIC {
            return Err(Error::BadMagic(header[0]));
        }
        let block_size = BigEndian::read_u32(&header[1..5]);
        let ranks = BigEndian::read_u32(&header[5..9]);
        if block_size == 0 || ranks == 0 {
            return Err(Error::Corrupted);
        }
        tracing::debug!(block_size, ranks, "checkpoint reader open");
        Ok(Reader {
            file,
            block_size,
            ranks,
            pos: Pos {
                block: 0,
                at: HEADER_BYTES,
            },
            end_of_stream: true,
        })
    }

    /// Rank count recorded in the file: the writing job's, not ours.
    pub fn ranks(&self) -> u32 {
        self.ranks
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Position at a rank's first block. Returns false when the rank
    /// wrote nothing (sparse or absent block).
    pub fn select_rank(&mut self, rank: u32) -> Result<bool> {
        if rank >= self.ranks {
            return Err(Error::Invalid(format!(
                "rank {rank} of a {}-rank checkpoint",
                self.ranks
            )));
        }
        self.enter_block(rank as u64)
    }

    /// Move to the start of `block`, consuming its magic byte (and the
    /// file header, for block 0). False means the stream ends here.
    fn enter_block(&mut self, block: u64) -> Result<bool> {
        self.pos = Pos { block, at: 0 };
        let mut magic = [0u8; 1];
        let offset = self.pos.offset(self.block_size);
        let n = self.file.read_at(&mut magic, offset)?;
        if n == 0 || magic[0] == 0 {
            // End of file, or a hole in a sparse file.
            self.end_of_stream = true;
            return Ok(false);
        }
        if magic[0] != BLOCK_MAGIC {
            self.end_of_stream = true;
            return Err(Error::Corrupted);
        }
        self.pos.at = if block == 0 { HEADER_BYTES } else { 1 };
        self.end_of_stream = false;
        Ok(true)
    }

    /// The stream position one byte past `pos`. Valid only where `pos`
    /// is a stream byte (never a block magic) and the step crosses at
    /// most one block boundary.
    fn next_stream_pos(&self, pos: Pos) -> Pos {
        let mut next = pos.advance(1, self.block_size, self.ranks);
        if next.at == 0 {
            next.at = 1; // the magic byte is not stream data
        }
        next
    }

    /// Read up to `out.len()` stream bytes, crossing blocks. Returns the
    /// bytes read; fewer than requested only at end of stream.
    fn read_stream(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < out.len() && !self.end_of_stream {
            if self.pos.at == self.block_size {
                if !self.enter_block(self.pos.block + self.ranks as u64)? {
                    break;
                }
            }
            let room = (self.block_size - self.pos.at) as usize;
            let n = room.min(out.len() - filled);
            let offset = self.pos.offset(self.block_size);
            let got = self.file.read_at(&mut out[filled..filled + n], offset)?;
            filled += got;
            self.pos.at += got as u32;
            if got == 0 {
                self.end_of_stream = true;
            }
        }
        Ok(filled)
    }

    fn read_u32(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.read_stream(&mut buf)? {
            4 => Ok(Some(BigEndian::read_u32(&buf))),
            _ => Ok(None),
        }
    }

    /// Read the next record of the selected rank.
    pub fn read_record(&mut self) -> Result<ReadOutcome> {
        if self.end_of_stream {
            return Ok(ReadOutcome::EndOfRank);
        }
        // Normalize a cursor parked flush at a block end, so the record's
        // start (and the resync point) name real stream bytes.
        if self.pos.at == self.block_size {
            if !self.enter_block(self.pos.block + self.ranks as u64)? {
                return Ok(ReadOutcome::EndOfRank);
            }
        }
        let record_start = self.pos;
        let resync_from = self.next_stream_pos(record_start);

        let mut sync_buf = [0u8; 4];
        if self.read_stream(&mut sync_buf)? < 4 {
            // The stream ended at (or just past) a record boundary.
            return Ok(ReadOutcome::EndOfRank);
        }
        let sync_ok = BigEndian::read_u32(&sync_buf) == SYNC_MARKER;
        if !sync_ok {
            // Sync is not CRC-covered: a real record with a flipped sync
            // byte still verifies below. Zero bytes here are block slack
            // too short for an end-of-stream marker.
            tracing::debug!("sync marker mismatch at record start");
        }

        let Some(crc_stored) = self.read_u32()? else {
            return Ok(if sync_ok {
                ReadOutcome::Truncated
            } else {
                ReadOutcome::EndOfRank
            });
        };

        // Record length, byte at a time: it may span a block boundary.
        let mut rec_len_enc = [0u8; vint::MAX_BYTES];
        let mut decoder = vint::Decoder::new();
        let rec_len = loop {
            let mut byte = [0u8; 1];
            if self.read_stream(&mut byte)? == 0 {
                return Ok(if sync_ok {
                    ReadOutcome::Truncated
                } else {
                    ReadOutcome::EndOfRank
                });
            }
            rec_len_enc[decoder.consumed()] = byte[0];
            match decoder.step(byte[0]) {
                Ok(vint::Step::Done(v)) => break v,
                Ok(vint::Step::More) => (),
                Err(_) => return self.resync(resync_from),
            }
        };
        let rec_len_encb = decoder.consumed();
        if !(0..=MAX_RECORD_LEN).contains(&rec_len) {
            return self.resync(resync_from);
        }

        if rec_len == 0 {
            // End-of-stream marker; its CRC covers just the length field.
            let mut digest = CRC32.digest();
            digest.update(&rec_len_enc[..rec_len_encb]);
            if digest.finalize() != crc_stored {
                return self.resync(resync_from);
            }
            self.end_of_stream = true;
            return Ok(ReadOutcome::EndOfRank);
        }

        // Key length, also byte at a time so the value offset below is
        // block-exact.
        let mut key_len_enc = [0u8; vint::MAX_BYTES];
        let mut decoder = vint::Decoder::new();
        let key_len = loop {
            let mut byte = [0u8; 1];
            if self.read_stream(&mut byte)? == 0 {
                return Ok(ReadOutcome::Truncated);
            }
            key_len_enc[decoder.consumed()] = byte[0];
            match decoder.step(byte[0]) {
                Ok(vint::Step::Done(v)) => break v,
                Ok(vint::Step::More) => (),
                Err(_) => return self.resync(resync_from),
            }
        };
        let key_len_encb = decoder.consumed();
        if key_len < 0 || key_len > rec_len - key_len_encb as i64 {
            return self.resync(resync_from);
        }
        let key_len = key_len as usize;
        let val_len = rec_len as usize - key_len_encb - key_len;

        let mut key = vec![0u8; key_len];
        if self.read_stream(&mut key)? < key_len {
            return Ok(ReadOutcome::Truncated);
        }

        // Where the value's bytes begin, skipping a block magic if the
        // key ended flush against the boundary.
        if val_len > 0 && self.pos.at == self.block_size {
            if !self.enter_block(self.pos.block + self.ranks as u64)? {
                return Ok(ReadOutcome::Truncated);
            }
        }
        let val_offset = self.pos.offset(self.block_size);

        let mut value = vec![0u8; val_len];
        if self.read_stream(&mut value)? < val_len {
            return Ok(ReadOutcome::Truncated);
        }

        let mut digest = CRC32.digest();
        digest.update(&rec_len_enc[..rec_len_encb]);
        digest.update(&key_len_enc[..key_len_encb]);
        digest.update(&key);
        digest.update(&value);
        if digest.finalize() != crc_stored {
            tracing::debug!(
                offset = record_start.offset(self.block_size),
                "record failed CRC"
            );
            return self.resync(resync_from);
        }

        Ok(ReadOutcome::Record(Record {
            key: key.into(),
            value: value.into(),
            val_offset,
        }))
    }

    /// After a bad record: scan forward from one byte past its sync marker
    /// for the next marker, and leave the reader positioned on it.
    fn resync(&mut self, from: Pos) -> Result<ReadOutcome> {
        self.pos = from;
        self.end_of_stream = false;

        let mut window_start = from;
        let Some(mut window) = self.read_u32()? else {
            self.end_of_stream = true;
            return Ok(ReadOutcome::Corrupt);
        };
        loop {
            if window == SYNC_MARKER {
                self.pos = window_start;
                self.end_of_stream = false;
                return Ok(ReadOutcome::Corrupt);
            }
            let mut byte = [0u8; 1];
            if self.read_stream(&mut byte)? == 0 {
                self.end_of_stream = true;
                return Ok(ReadOutcome::Corrupt);
            }
            window = (window << 8) | byte[0] as u32;
            window_start = self.next_stream_pos(window_start);
        }
    }

    /// Read a value by the offset `write_record` returned, following the
    /// owning rank's block chain. Repositions the reader: select a rank
    /// again before reading further records.
    pub fn read_value_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.pos = Pos {
            block: offset / self.block_size as u64,
            at: (offset % self.block_size as u64) as u32,
        };
        self.end_of_stream = false;
        let mut out = vec![0u8; len];
        let got = self.read_stream(&mut out)?;
        if got < len {
            return Err(Error::Corrupted);
        }
        Ok(out)
    }
}
