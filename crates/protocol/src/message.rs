use crate::value::DataType;
use crate::{DatumId, Priority, Rank, Result, Target, Task, WorkType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Rpc wraps a worker request with its per-worker sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rpc {
    pub seq: u64,
    pub request: Request,
}

/// Reply pairs a response with the sequence number it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub seq: u64,
    pub response: Response,
}

/// Request is a worker-to-server RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Put {
        work_type: WorkType,
        priority: Priority,
        target: Target,
        parallelism: u32,
        answer_rank: Rank,
        payload: Bytes,
    },
    Get {
        accept_types: Vec<WorkType>,
        blocking: bool,
    },
    Create(CreateSpec),
    MultiCreate(Vec<CreateSpec>),
    Store {
        id: DatumId,
        data_type: DataType,
        /// Container insert when present: `bytes` is the member datum id.
        subscript: Option<Bytes>,
        bytes: Bytes,
        write_decrement: i64,
    },
    Retrieve {
        id: DatumId,
        subscript: Option<Bytes>,
        mode: RetrieveMode,
    },
    Subscribe {
        id: DatumId,
        subscript: Option<Bytes>,
    },
    RefcountIncr {
        id: DatumId,
        read_delta: i64,
        write_delta: i64,
    },
    Exists {
        id: DatumId,
        subscript: Option<Bytes>,
    },
    UniqueId,
    Finalize,
    Fail {
        code: i32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpec {
    /// Caller-chosen id; must map to the receiving server.
    pub hint: Option<DatumId>,
    pub data_type: DataType,
    pub read_rc: i64,
    pub write_rc: i64,
    pub permanent: bool,
}

impl CreateSpec {
    pub fn new(data_type: DataType) -> CreateSpec {
        CreateSpec {
            hint: None,
            data_type,
            read_rc: 1,
            write_rc: 1,
            permanent: false,
        }
    }
}

/// Whether a Retrieve decrements the read refcount after copying out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrieveMode {
    ReadRc,
    NoRc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeOutcome {
    AlreadyReady,
    Pending,
}

/// ParallelGroup accompanies a parallel task's assignment: the cohort's
/// ranks and this member's index, enough to build a task sub-communicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub group_id: u64,
    pub member_index: u32,
    pub ranks: Vec<Rank>,
}

/// TaskAssignment is the payload of a successful Get.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub work_type: WorkType,
    pub answer_rank: Rank,
    pub payload: Bytes,
    pub parallel: Option<ParallelGroup>,
}

/// Response is a server-to-worker RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Put(Result<()>),
    Task(TaskAssignment),
    /// A non-blocking Get found nothing.
    NoTask,
    /// The job is quiescent; the worker should exit its loop.
    Shutdown,
    Created(Result<DatumId>),
    MultiCreated(Result<Vec<DatumId>>),
    Stored(Result<()>),
    Retrieved(Result<(DataType, Bytes)>),
    Subscribed(Result<SubscribeOutcome>),
    Refcounted(Result<()>),
    Exists(bool),
    UniqueId(DatumId),
    Finalized,
    /// A malformed request (empty accept set, undeclared type, …).
    Error(crate::Error),
}

/// ServerMsg is server-to-server control traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMsg {
    /// Periodic advertisement of stealable work.
    LoadSummary {
        counts: Vec<(WorkType, usize)>,
        max_priority: Vec<(WorkType, Priority)>,
    },
    /// Ask a peer for work. `known_best` carries the thief's best local
    /// priority per wanted type (None when it holds none of that type);
    /// the victim only surrenders strictly better work.
    StealRequest {
        wants: Vec<(WorkType, Option<Priority>)>,
        max_tasks: usize,
    },
    StealResponse {
        tasks: Vec<Task>,
    },
    /// Forward a task (typically a CONTROL notification) to the home
    /// server of its hard-targeted rank.
    Deliver {
        task: Task,
    },
    /// Termination-detection ring token. `clean` survives a sweep only
    /// if every server was quiet and undisturbed since the last pass.
    Token {
        sweep: u64,
        clean: bool,
    },
    /// Quiescence confirmed; answer parked Gets with Shutdown.
    Shutdown,
    /// A worker requested job abort.
    Abort {
        code: i32,
    },
}

/// NotifyEvent distinguishes data-readiness from destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyEvent {
    Ready,
    Closed,
}

/// Notification is the payload of a CONTROL task: the datum (and optional
/// container subscript) a subscriber waited on, and what happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: DatumId,
    pub subscript: Option<Bytes>,
    pub event: NotifyEvent,
}

impl Notification {
    pub fn encode(&self) -> Bytes {
        crate::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Notification> {
        crate::decode(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rpc_round_trips_through_envelope_encoding() {
        let rpc = Rpc {
            seq: 7,
            request: Request::Put {
                work_type: 1,
                priority: -3,
                target: Target::soft(2),
                parallelism: 4,
                answer_rank: 0,
                payload: Bytes::from_static(b"body"),
            },
        };
        let bytes = crate::encode(&rpc);
        let got: Rpc = crate::decode(&bytes).unwrap();
        assert_eq!(got.seq, 7);
        match got.request {
            Request::Put {
                work_type, target, ..
            } => {
                assert_eq!(work_type, 1);
                assert_eq!(target, Target::soft(2));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn notification_round_trips() {
        let n = Notification {
            id: 42,
            subscript: Some(Bytes::from_static(b"k")),
            event: NotifyEvent::Ready,
        };
        assert_eq!(Notification::decode(&n.encode()).unwrap(), n);
    }
}
