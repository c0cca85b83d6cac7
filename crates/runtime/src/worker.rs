use crate::config::Config;
use crate::topology::Topology;
use bytes::Bytes;
use protocol::value::{DataType, Value};
use protocol::{
    CreateSpec, DatumId, Error, Notification, Priority, Rank, Reply, Request, Response,
    RetrieveMode, Rpc, SubscribeOutcome, Target, TaskAssignment, WorkType,
};
use transport::{Comm, Tag};

/// Worker is the client side of the runtime: a thin RPC wrapper that
/// blocks inside each call until its reply arrives. Task requests go to
/// the worker's home server; data requests go straight to the server
/// owning the datum id.
pub struct Worker<C: Comm> {
    comm: C,
    topology: Topology,
    seq: u64,
}

impl<C: Comm> Worker<C> {
    pub(crate) fn new(_cfg: Config, topology: Topology, comm: C) -> Worker<C> {
        Worker {
            comm,
            topology,
            seq: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn num_workers(&self) -> u32 {
        self.topology.workers()
    }

    fn home_server(&self) -> Rank {
        self.topology.home_server_of(self.comm.rank())
    }

    fn call(&mut self, dst: Rank, request: Request) -> Result<Response, Error> {
        self.seq += 1;
        let rpc = Rpc {
            seq: self.seq,
            request,
        };
        self.comm
            .send(dst, Tag::Rpc, protocol::encode(&rpc))
            .map_err(|_| Error::Shutdown)?;
        loop {
            let envelope = self.comm.recv().map_err(|_| Error::Shutdown)?;
            if envelope.tag != Tag::Reply {
                tracing::warn!(tag = ?envelope.tag, "worker ignoring a non-reply message");
                continue;
            }
            let reply: Reply = protocol::decode(&envelope.payload)?;
            if reply.seq != self.seq {
                tracing::warn!(
                    got = reply.seq,
                    want = self.seq,
                    "worker ignoring a stale reply"
                );
                continue;
            }
            return Ok(reply.response);
        }
    }

    /// Submit a task.
    pub fn put(
        &mut self,
        work_type: WorkType,
        priority: Priority,
        target: Target,
        parallelism: u32,
        answer_rank: Rank,
        payload: Bytes,
    ) -> Result<(), Error> {
        let request = Request::Put {
            work_type,
            priority,
            target,
            parallelism,
            answer_rank,
            payload,
        };
        match self.call(self.home_server(), request)? {
            Response::Put(result) => result,
            other => Err(unexpected("Put", &other)),
        }
    }

    /// Block for a task. `Ok(None)` means the job is quiescent and the
    /// worker should exit its loop.
    pub fn get(&mut self, accept_types: &[WorkType]) -> Result<Option<TaskAssignment>, Error> {
        let request = Request::Get {
            accept_types: accept_types.to_vec(),
            blocking: true,
        };
        match self.call(self.home_server(), request)? {
            Response::Task(assignment) => Ok(Some(assignment)),
            Response::Shutdown => Ok(None),
            Response::Error(err) => Err(err),
            other => Err(unexpected("Get", &other)),
        }
    }

    /// Probe for a task without blocking for one: `Ok(None)` when the
    /// server has nothing eligible right now.
    pub fn try_get(&mut self, accept_types: &[WorkType]) -> Result<Option<TaskAssignment>, Error> {
        let request = Request::Get {
            accept_types: accept_types.to_vec(),
            blocking: false,
        };
        match self.call(self.home_server(), request)? {
            Response::Task(assignment) => Ok(Some(assignment)),
            Response::NoTask => Ok(None),
            Response::Shutdown => Err(Error::Shutdown),
            Response::Error(err) => Err(err),
            other => Err(unexpected("Get", &other)),
        }
    }

    pub fn create(&mut self, spec: CreateSpec) -> Result<DatumId, Error> {
        let dst = match spec.hint {
            Some(hint) => self.topology.data_server_of(hint),
            None => self.home_server(),
        };
        match self.call(dst, Request::Create(spec))? {
            Response::Created(result) => result,
            other => Err(unexpected("Create", &other)),
        }
    }

    /// Allocate a batch of datums in one round trip. Hints must all map
    /// to the same server.
    pub fn multi_create(&mut self, specs: Vec<CreateSpec>) -> Result<Vec<DatumId>, Error> {
        let dst = match specs.iter().find_map(|s| s.hint) {
            Some(hint) => self.topology.data_server_of(hint),
            None => self.home_server(),
        };
        match self.call(dst, Request::MultiCreate(specs))? {
            Response::MultiCreated(result) => result,
            other => Err(unexpected("MultiCreate", &other)),
        }
    }

    pub fn store(
        &mut self,
        id: DatumId,
        data_type: DataType,
        bytes: Bytes,
        write_decrement: i64,
    ) -> Result<(), Error> {
        let request = Request::Store {
            id,
            data_type,
            subscript: None,
            bytes,
            write_decrement,
        };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Stored(result) => result,
            other => Err(unexpected("Store", &other)),
        }
    }

    /// Encode and store a typed value.
    pub fn store_value(
        &mut self,
        id: DatumId,
        value: &Value,
        write_decrement: i64,
    ) -> Result<(), Error> {
        self.store(id, value.data_type(), value.encode(), write_decrement)
    }

    /// Commit `member` into a container under `subscript`. The sender
    /// must pair this with a read-refcount increment on `member` when it
    /// is handing its own reference over.
    pub fn insert(
        &mut self,
        id: DatumId,
        subscript: Bytes,
        member: DatumId,
        write_decrement: i64,
    ) -> Result<(), Error> {
        let request = Request::Store {
            id,
            data_type: DataType::Ref,
            subscript: Some(subscript),
            bytes: Value::Ref(member).encode(),
            write_decrement,
        };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Stored(result) => result,
            other => Err(unexpected("Store", &other)),
        }
    }

    pub fn retrieve(&mut self, id: DatumId, mode: RetrieveMode) -> Result<(DataType, Bytes), Error> {
        let request = Request::Retrieve {
            id,
            subscript: None,
            mode,
        };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Retrieved(result) => result,
            other => Err(unexpected("Retrieve", &other)),
        }
    }

    /// Retrieve and decode a typed value.
    pub fn retrieve_value(&mut self, id: DatumId, mode: RetrieveMode) -> Result<Value, Error> {
        let (data_type, bytes) = self.retrieve(id, mode)?;
        Value::decode(data_type, &bytes)
    }

    /// Look up the member id under a container subscript.
    pub fn lookup(&mut self, id: DatumId, subscript: Bytes) -> Result<DatumId, Error> {
        let request = Request::Retrieve {
            id,
            subscript: Some(subscript),
            mode: RetrieveMode::NoRc,
        };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Retrieved(result) => {
                let (data_type, bytes) = result?;
                match Value::decode(data_type, &bytes)? {
                    Value::Ref(member) => Ok(member),
                    other => Err(Error::Invalid(format!(
                        "container member decoded as {:?}",
                        other.data_type()
                    ))),
                }
            }
            other => Err(unexpected("Retrieve", &other)),
        }
    }

    pub fn subscribe(
        &mut self,
        id: DatumId,
        subscript: Option<Bytes>,
    ) -> Result<SubscribeOutcome, Error> {
        let request = Request::Subscribe { id, subscript };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Subscribed(result) => result,
            other => Err(unexpected("Subscribe", &other)),
        }
    }

    pub fn refcount_incr(
        &mut self,
        id: DatumId,
        read_delta: i64,
        write_delta: i64,
    ) -> Result<(), Error> {
        let request = Request::RefcountIncr {
            id,
            read_delta,
            write_delta,
        };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Refcounted(result) => result,
            other => Err(unexpected("RefcountIncr", &other)),
        }
    }

    pub fn exists(&mut self, id: DatumId, subscript: Option<Bytes>) -> Result<bool, Error> {
        let request = Request::Exists { id, subscript };
        match self.call(self.topology.data_server_of(id), request)? {
            Response::Exists(exists) => Ok(exists),
            other => Err(unexpected("Exists", &other)),
        }
    }

    /// A fresh unused id from this worker's home server.
    pub fn unique_id(&mut self) -> Result<DatumId, Error> {
        match self.call(self.home_server(), Request::UniqueId)? {
            Response::UniqueId(id) => Ok(id),
            other => Err(unexpected("UniqueId", &other)),
        }
    }

    /// Decode the payload of a CONTROL task.
    pub fn decode_notification(payload: &[u8]) -> Result<Notification, Error> {
        Notification::decode(payload)
    }

    /// Tell the home server this worker is done, then quiesce with the
    /// rest of the world.
    pub fn finalize(mut self) -> Result<(), Error> {
        match self.call(self.home_server(), Request::Finalize)? {
            Response::Finalized => {
                self.comm.barrier();
                Ok(())
            }
            other => Err(unexpected("Finalize", &other)),
        }
    }

    /// Propagate an abort across the job. Does not return to a barrier;
    /// the job is going down.
    pub fn fail(mut self, code: i32) -> Result<(), Error> {
        let _ = self.call(self.home_server(), Request::Fail { code })?;
        Ok(())
    }
}

fn unexpected(call: &str, response: &Response) -> Error {
    if let Response::Error(err) = response {
        return err.clone();
    }
    Error::Invalid(format!("unexpected response to {call}: {response:?}"))
}
