//! The block-striped checkpoint log.
//!
//! Every rank of a job appends records to one shared file. The file is
//! divided into fixed-size blocks owned round-robin: rank `r` of `R` writes
//! blocks `r, r+R, r+2R, …`, so ranks never contend and a reader can walk
//! any single rank's stream as if it were contiguous. Records are CRC-32
//! checked and begin with a sync marker, letting the reader skip a corrupt
//! or torn record and resynchronise on the next one.
//!
//! Record layout, all integers big-endian or vint:
//!
//! ```text
//! [sync 0x5F1C0B73][crc32][rec_len vint][key_len vint][key][value]
//! ```
//!
//! `rec_len` covers everything after the CRC; the CRC covers everything
//! after itself. A zero `rec_len` marks the end of a rank's stream.

mod index;
mod layout;
mod log;
mod reader;
mod reload;
mod writer;

pub use index::{Index, IndexEntry};
pub use log::Log;
pub use reader::{ReadOutcome, Reader, Record};
pub use reload::{reload, RankStats};
pub use writer::{Options, Writer};

/// Magic byte at the start of every written block.
pub(crate) const BLOCK_MAGIC: u8 = 0x42;

/// Sync marker preceding every record.
pub(crate) const SYNC_MARKER: u32 = 0x5F1C_0B73;

/// Bytes of block 0 occupied by the file header:
/// magic, block size, rank count.
pub(crate) const HEADER_BYTES: u32 = 9;

/// An end-of-stream marker record: sync, CRC, vint-encoded zero.
pub(crate) const EOF_RECORD_BYTES: u32 = 9;

pub(crate) const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a checkpoint file: magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("corrupted checkpoint structure")]
    Corrupted,
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
