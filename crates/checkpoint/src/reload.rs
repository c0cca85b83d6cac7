use crate::{ReadOutcome, Reader, Record, Result};
use std::path::Path;

/// Per-rank tally of a reload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankStats {
    pub rank: u32,
    pub valid: u64,
    /// Records skipped over a failed CRC, plus records `apply` rejected.
    pub invalid: u64,
    /// 1 when the rank's stream ended mid-record (a torn final write).
    pub truncated: u64,
}

/// Walk every rank of the checkpoint at `path`, handing each intact record
/// to `apply`. Corrupt records are counted and skipped, never fatal: a
/// torn trailing record after a crash is expected. `apply` returning false
/// counts the record invalid (an undecodable application payload).
///
/// The walk covers the rank count recorded in the file, so a checkpoint
/// from an R-server run reloads under any current server count.
pub fn reload<F>(path: &Path, mut apply: F) -> Result<Vec<RankStats>>
where
    F: FnMut(u32, Record) -> bool,
{
    let mut reader = Reader::open(path)?;
    let mut all = Vec::with_capacity(reader.ranks() as usize);

    for rank in 0..reader.ranks() {
        let mut stats = RankStats {
            rank,
            ..RankStats::default()
        };
        if reader.select_rank(rank)? {
            loop {
                match reader.read_record() {
                    Ok(ReadOutcome::Record(record)) => {
                        if apply(rank, record) {
                            stats.valid += 1;
                        } else {
                            stats.invalid += 1;
                        }
                    }
                    Ok(ReadOutcome::Corrupt) => stats.invalid += 1,
                    Ok(ReadOutcome::Truncated) => {
                        stats.truncated = 1;
                        break;
                    }
                    Ok(ReadOutcome::EndOfRank) => break,
                    Err(err) => {
                        // Structural damage (an unreadable block magic):
                        // give up on this rank, keep the rest.
                        tracing::warn!(rank, %err, "abandoning rank mid-reload");
                        stats.invalid += 1;
                        break;
                    }
                }
            }
        }
        tracing::debug!(
            rank,
            valid = stats.valid,
            invalid = stats.invalid,
            truncated = stats.truncated,
            "rank reloaded"
        );
        all.push(stats);
    }
    Ok(all)
}
