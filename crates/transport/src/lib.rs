//! Point-to-point message transport.
//!
//! The server core only ever performs non-blocking sends and probes, plus
//! one blocking receive at quiescence, so the whole fabric sits behind the
//! [`Comm`] trait. [`Grid`] is the in-process implementation used by tests
//! and single-host runs; an MPI-backed `Comm` is a drop-in substitution.

use bytes::Bytes;
use protocol::Rank;

mod grid;
pub use grid::{Grid, GridComm};

/// Tag discriminates the message streams multiplexed over one link.
/// Ordering is guaranteed per (source, destination, tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Worker-to-server RPC.
    Rpc,
    /// Server-to-worker RPC reply.
    Reply,
    /// Server-to-server control traffic.
    Server,
}

/// Envelope is one received message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub src: Rank,
    pub tag: Tag,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rank {0} has disconnected")]
    Disconnected(Rank),
    #[error("the job has shut down")]
    Closed,
}

/// Comm is one rank's endpoint of the job fabric.
///
/// Sends are reliable and ordered per (src, dst, tag). The buffer passed to
/// `send` is owned by the transport from that point on and released exactly
/// once, after delivery. Handlers must never block: all waiting is confined
/// to `recv`, which the server enters only when it has nothing else to do.
pub trait Comm: Send {
    fn rank(&self) -> Rank;

    /// Total ranks in the world communicator.
    fn world(&self) -> u32;

    /// Non-blocking, reliable, ordered send.
    fn send(&self, dst: Rank, tag: Tag, payload: Bytes) -> Result<(), Error>;

    /// One probe pass: the next pending message, if any. Never blocks.
    fn try_recv(&mut self) -> Option<Envelope>;

    /// Block until a message arrives.
    fn recv(&mut self) -> Result<Envelope, Error>;

    /// Collective quiesce over the world. Used at init and shutdown.
    fn barrier(&self);
}
