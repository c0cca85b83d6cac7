use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod message;
pub mod value;
pub mod vint;

pub use message::{
    CreateSpec, Notification, NotifyEvent, ParallelGroup, Reply, Request, Response, RetrieveMode,
    Rpc, ServerMsg, SubscribeOutcome, TaskAssignment,
};
pub use value::{DataType, Value};

/// Rank is an MPI-style process rank within the job's world communicator.
pub type Rank = u32;

/// WorkType is a small task-type integer from the vector declared at init.
/// `ANY_TYPE` is the wildcard accepted in Get requests.
pub type WorkType = i32;

pub const ANY_TYPE: WorkType = -1;

/// CONTROL is the reserved work type used to deliver data-readiness
/// notifications through the ordinary task-dispatch path.
pub const CONTROL: WorkType = 0;

/// Priority of a task. Higher is more urgent.
pub type Priority = i32;

/// DatumId identifies a single-assignment datum, unique across the job.
/// Ids are allocated in server-local sequences: the home server of `id`
/// is `id % num_servers`.
pub type DatumId = i64;

/// Strictness of a task's rank targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strictness {
    /// Only the targeted rank (or node, per `Accuracy`) may run the task.
    Hard,
    /// Prefer the target, but fall back to any eligible requester.
    Soft,
}

/// Accuracy of a task's rank targeting: the specific rank, or any rank
/// sharing that rank's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accuracy {
    Rank,
    Node,
}

/// Target constrains which workers may be handed a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// None targets any rank.
    pub rank: Option<Rank>,
    pub strictness: Strictness,
    pub accuracy: Accuracy,
}

impl Target {
    pub fn any() -> Target {
        Target {
            rank: None,
            strictness: Strictness::Soft,
            accuracy: Accuracy::Rank,
        }
    }

    /// Hard-target a specific rank.
    pub fn rank(rank: Rank) -> Target {
        Target {
            rank: Some(rank),
            strictness: Strictness::Hard,
            accuracy: Accuracy::Rank,
        }
    }

    /// Soft-target a rank: prefer it, accept any.
    pub fn soft(rank: Rank) -> Target {
        Target {
            rank: Some(rank),
            strictness: Strictness::Soft,
            accuracy: Accuracy::Rank,
        }
    }

    /// Hard-target any rank on the node of `rank`.
    pub fn node(rank: Rank) -> Target {
        Target {
            rank: Some(rank),
            strictness: Strictness::Hard,
            accuracy: Accuracy::Node,
        }
    }

    pub fn is_any(&self) -> bool {
        self.rank.is_none()
    }
}

/// Task is one unit of work held by a server's work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Per-server monotonic sequence number, assigned by `WorkQueue::put`.
    pub seqno: u64,
    pub work_type: WorkType,
    pub priority: Priority,
    /// Number of workers which must run the task simultaneously. 1 is serial.
    pub parallelism: u32,
    pub target: Target,
    /// Worker rank to be told the task's result; opaque to the server.
    pub answer_rank: Rank,
    /// Server currently holding the task. Re-stamped when stolen.
    pub home_server: Rank,
    /// Set while a parallel cohort is being assembled for the task.
    pub pin_rank: Option<Rank>,
    pub payload: Bytes,
}

impl Task {
    pub fn pinned(&self) -> bool {
        self.pin_rank.is_some()
    }
}

/// WorkRequest is one idle worker's registration in a server's request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub worker: Rank,
    pub rq_seqno: u64,
    /// Non-empty; may contain `ANY_TYPE` as a wildcard.
    pub accept_types: Vec<WorkType>,
    /// True when the worker is blocked awaiting the reply.
    pub blocking: bool,
}

impl WorkRequest {
    pub fn accepts(&self, work_type: WorkType) -> bool {
        self.accept_types
            .iter()
            .any(|&t| t == work_type || t == ANY_TYPE)
    }
}

/// Error is the result taxonomy shared by every operation in the runtime.
/// Operations never retry internally; recovery belongs to the caller.
/// Invariant violations are not represented here: they panic (Fatal).
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("payload of {got} bytes exceeds the {max} byte bound")]
    PayloadTooLarge { got: usize, max: usize },
    #[error("datum <{0}> not found")]
    NotFound(DatumId),
    #[error("datum <{id}> has type {actual:?}, not {requested:?}")]
    WrongType {
        id: DatumId,
        requested: DataType,
        actual: DataType,
    },
    #[error("datum <{0}> is already set")]
    DoubleWrite(DatumId),
    #[error("datum <{0}> is unset")]
    Unset(DatumId),
    #[error("datum <{0}> is closed")]
    Closed(DatumId),
    #[error("corrupted record")]
    Corrupted,
    #[error("shutdown")]
    Shutdown,
    #[error("invalid request: {0}")]
    Invalid(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encode a wire message. Messages always serialize.
pub fn encode<T: Serialize>(msg: &T) -> Bytes {
    bincode::serialize(msg)
        .expect("wire messages always serialize")
        .into()
}

/// Decode a wire message, mapping malformed input to `Error::Corrupted`.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|_| Error::Corrupted)
}
