use crate::config::Config;
use crate::matcher::Cohort;
use crate::steal::StealState;
use crate::topology::Topology;
use bytes::Bytes;
use datastore::{Cache, Event, Store};
use protocol::{
    Error, Notification, Priority, Rank, Reply, Request, Response, RetrieveMode, Rpc, ServerMsg,
    Target, Task, CONTROL,
};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use transport::{Comm, Envelope, Tag};
use workqueue::{NodeMap, RequestQueue, WorkQueue};

/// Notifications outrank all user work so subscribers unblock promptly.
pub(crate) const NOTIFY_PRIORITY: Priority = Priority::MAX;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("job aborted with code {0}")]
    Aborted(i32),
    #[error(transparent)]
    Transport(#[from] transport::Error),
}

/// Server is the per-rank core: all state lives here, owned by the
/// progress loop and mutated only between messages. No locks, no
/// background threads; handlers run to completion.
pub struct Server<C: Comm> {
    pub(crate) comm: C,
    pub(crate) cfg: Config,
    pub(crate) topology: Topology,
    pub(crate) wq: WorkQueue,
    pub(crate) rq: RequestQueue,
    pub(crate) store: Store,
    pub(crate) cache: Cache,

    /// Parallel cohorts being assembled, keyed by pinned task seqno.
    pub(crate) cohorts: HashMap<u64, Cohort>,
    pub(crate) next_group: u64,
    pub(crate) steal: StealState,

    /// Outstanding blocking Get RPC seq per parked worker.
    pub(crate) pending_get_seq: HashMap<Rank, u64>,
    pub(crate) finalized: HashSet<Rank>,

    /// Progress rounds; the coarse clock for steal cooldowns and cohorts.
    pub(crate) round: u64,
    /// Activity since the termination token last passed through.
    pub(crate) dirty: bool,
    pub(crate) token_in_flight: bool,
    pub(crate) clean_sweeps: u32,
    pub(crate) held_token: Option<(u64, bool)>,
    pub(crate) shutdown: bool,
    pub(crate) aborted: Option<i32>,
    /// Every peer endpoint disappeared without an orderly shutdown; give
    /// up without the final barrier.
    world_lost: bool,

    start: Instant,
}

impl<C: Comm> Server<C> {
    pub fn new(cfg: Config, topology: Topology, comm: C) -> Server<C> {
        let index = topology.server_index(comm.rank());
        let nodes = match &cfg.nodes {
            Some(nodes) => NodeMap::from_nodes(nodes.clone()),
            None => NodeMap::distinct(topology.world()),
        };
        let wq = WorkQueue::new(
            comm.rank(),
            cfg.types.clone(),
            cfg.max_payload,
            cfg.max_tasks,
            nodes,
        );
        let rq = RequestQueue::new(cfg.types.clone());
        let store = Store::new(index, topology.servers());
        let cache = Cache::new(cfg.cache_entries, cfg.cache_bytes);
        Server {
            comm,
            topology,
            wq,
            rq,
            store,
            cache,
            cohorts: HashMap::new(),
            next_group: 1,
            steal: StealState::new(&cfg),
            pending_get_seq: HashMap::new(),
            finalized: HashSet::new(),
            round: 0,
            dirty: false,
            token_in_flight: false,
            clean_sweeps: 0,
            held_token: None,
            shutdown: false,
            aborted: None,
            world_lost: false,
            start: Instant::now(),
            cfg,
        }
    }

    /// Mutable access to the data store, for pre-run checkpoint recovery.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    /// The progress loop: drain messages, match, steal, detect
    /// quiescence. Returns after an orderly shutdown barrier, or with
    /// the abort code a worker propagated.
    pub fn run(mut self) -> Result<(), RunError> {
        tracing::info!(rank = self.comm.rank(), "server loop starting");
        loop {
            let mut progressed = false;
            while let Some(envelope) = self.comm.try_recv() {
                self.handle(envelope)?;
                progressed = true;
            }
            progressed |= self.match_round()?;
            self.forward_held_token()?;

            if self.done() {
                break;
            }
            if !progressed {
                self.idle()?;
                if self.done() {
                    break;
                }
            }
        }

        if let Some(code) = self.aborted {
            return Err(RunError::Aborted(code));
        }
        if self.cfg.print_time {
            tracing::info!(
                elapsed_s = self.start.elapsed().as_secs_f64(),
                "server finalized"
            );
        }
        if !self.world_lost {
            self.comm.barrier();
        }
        Ok(())
    }

    fn done(&self) -> bool {
        if self.aborted.is_some() || self.world_lost {
            return true;
        }
        let index = self.topology.server_index(self.comm.rank());
        self.shutdown
            && self
                .topology
                .workers_of(index)
                .all(|w| self.finalized.contains(&w))
    }

    /// Nothing to do: initiate or relay termination detection, then park
    /// in the only blocking wait the server ever makes.
    fn idle(&mut self) -> Result<(), RunError> {
        self.begin_quiescence_checks()?;
        if self.done() {
            return Ok(());
        }
        match self.comm.recv() {
            Ok(envelope) => self.handle(envelope),
            Err(_) => {
                // Every peer endpoint is gone; nothing further can arrive.
                tracing::warn!("all peers disconnected; abandoning the loop");
                self.world_lost = true;
                Ok(())
            }
        }
    }

    fn handle(&mut self, envelope: Envelope) -> Result<(), RunError> {
        match envelope.tag {
            Tag::Rpc => {
                let rpc: Rpc = match protocol::decode(&envelope.payload) {
                    Ok(rpc) => rpc,
                    Err(_) => {
                        tracing::error!(src = envelope.src, "undecodable RPC dropped");
                        return Ok(());
                    }
                };
                self.dirty = true;
                self.handle_rpc(envelope.src, rpc)
            }
            Tag::Server => {
                let msg: ServerMsg = match protocol::decode(&envelope.payload) {
                    Ok(msg) => msg,
                    Err(_) => {
                        tracing::error!(src = envelope.src, "undecodable peer message dropped");
                        return Ok(());
                    }
                };
                self.handle_peer(envelope.src, msg)
            }
            Tag::Reply => {
                tracing::warn!(src = envelope.src, "server received a stray reply");
                Ok(())
            }
        }
    }

    fn handle_rpc(&mut self, src: Rank, rpc: Rpc) -> Result<(), RunError> {
        let Rpc { seq, request } = rpc;
        tracing::trace!(src, seq, ?request, "rpc");
        match request {
            Request::Put {
                work_type,
                priority,
                target,
                parallelism,
                answer_rank,
                payload,
            } => {
                let result = self
                    .handle_put(work_type, priority, target, parallelism, answer_rank, payload)?;
                self.reply(src, seq, Response::Put(result))
            }
            Request::Get {
                accept_types,
                blocking,
            } => self.handle_get(src, seq, accept_types, blocking),
            Request::Create(spec) => {
                let result = self.store.create(&spec);
                self.flush_store_events()?;
                self.reply(src, seq, Response::Created(result))
            }
            Request::MultiCreate(specs) => {
                let result = self.store.multi_create(&specs);
                self.flush_store_events()?;
                self.reply(src, seq, Response::MultiCreated(result))
            }
            Request::Store {
                id,
                data_type,
                subscript,
                bytes,
                write_decrement,
            } => {
                let result = self
                    .store
                    .store(id, data_type, subscript, bytes, write_decrement);
                self.flush_store_events()?;
                self.reply(src, seq, Response::Stored(result))
            }
            Request::Retrieve {
                id,
                subscript,
                mode,
            } => {
                let result = self.handle_retrieve(id, subscript, mode);
                self.flush_store_events()?;
                self.reply(src, seq, Response::Retrieved(result))
            }
            Request::Subscribe { id, subscript } => {
                let result = self.store.subscribe(id, subscript, src);
                self.flush_store_events()?;
                self.reply(src, seq, Response::Subscribed(result))
            }
            Request::RefcountIncr {
                id,
                read_delta,
                write_delta,
            } => {
                let result = self.store.refcount_incr(id, read_delta, write_delta);
                // Everything the change caused is on the wire before the ack.
                self.flush_store_events()?;
                self.reply(src, seq, Response::Refcounted(result))
            }
            Request::Exists { id, subscript } => {
                let exists = self.store.exists(id, subscript.as_deref());
                self.reply(src, seq, Response::Exists(exists))
            }
            Request::UniqueId => {
                let id = self.store.unique_id();
                self.reply(src, seq, Response::UniqueId(id))
            }
            Request::Finalize => {
                self.finalized.insert(src);
                tracing::debug!(worker = src, "worker finalized");
                self.reply(src, seq, Response::Finalized)
            }
            Request::Fail { code } => {
                tracing::error!(worker = src, code, "worker failed; aborting job");
                self.aborted = Some(code);
                for peer in self.peer_servers() {
                    self.send_server(peer, &ServerMsg::Abort { code })?;
                }
                self.answer_parked(Response::Shutdown)?;
                self.reply(src, seq, Response::Shutdown)
            }
        }
    }

    fn handle_put(
        &mut self,
        work_type: protocol::WorkType,
        priority: Priority,
        target: Target,
        parallelism: u32,
        answer_rank: Rank,
        payload: Bytes,
    ) -> Result<Result<(), Error>, RunError> {
        if parallelism as u64 > self.topology.workers() as u64 {
            return Ok(Err(Error::Invalid(format!(
                "parallelism {parallelism} exceeds the {} workers in the job",
                self.topology.workers()
            ))));
        }
        // A rank-targeted task must live where its target's requests
        // arrive. Re-route if that is not here.
        if let Some(rank) = target.rank {
            if rank >= self.topology.workers() {
                return Ok(Err(Error::Invalid(format!("target {rank} is not a worker"))));
            }
            let home = self.topology.home_server_of(rank);
            if home != self.comm.rank() {
                if payload.len() > self.cfg.max_payload {
                    return Ok(Err(Error::PayloadTooLarge {
                        got: payload.len(),
                        max: self.cfg.max_payload,
                    }));
                }
                if !self.cfg.types.contains(&work_type) {
                    return Ok(Err(Error::Invalid(format!(
                        "undeclared work type {work_type}"
                    ))));
                }
                let task = Task {
                    seqno: 0, // assigned on arrival
                    work_type,
                    priority,
                    parallelism,
                    target,
                    answer_rank,
                    home_server: home,
                    pin_rank: None,
                    payload,
                };
                self.send_server(home, &ServerMsg::Deliver { task })?;
                return Ok(Ok(()));
            }
        }
        let was_empty = self.wq.count_available(work_type) == 0;
        match self
            .wq
            .put(work_type, priority, target, parallelism, answer_rank, payload)
        {
            Ok(seqno) => {
                tracing::trace!(seqno, work_type, priority, "task queued");
                self.steal.note_put(was_empty);
                self.broadcast_summary_if_due()?;
                Ok(Ok(()))
            }
            Err(err) => Ok(Err(err)),
        }
    }

    fn handle_get(
        &mut self,
        src: Rank,
        seq: u64,
        accept_types: Vec<protocol::WorkType>,
        blocking: bool,
    ) -> Result<(), RunError> {
        if self.shutdown {
            return self.reply(src, seq, Response::Shutdown);
        }
        let rq_seqno = match self.rq.push(src, accept_types, blocking) {
            Ok(rq_seqno) => rq_seqno,
            Err(err) => return self.reply(src, seq, Response::Error(err)),
        };
        self.pending_get_seq.insert(src, seq);
        self.match_round()?;
        self.try_steal()?;

        if !blocking && self.rq.pop_by_seqno(rq_seqno).is_some() {
            self.pending_get_seq.remove(&src);
            return self.reply(src, seq, Response::NoTask);
        }
        Ok(())
    }

    fn handle_retrieve(
        &mut self,
        id: protocol::DatumId,
        subscript: Option<Bytes>,
        mode: RetrieveMode,
    ) -> Result<(protocol::value::DataType, Bytes), Error> {
        if subscript.is_none() && mode == RetrieveMode::NoRc {
            if let Some(hit) = self.cache.retrieve(id) {
                tracing::trace!(id, "cache hit");
                return Ok(hit);
            }
        }
        let (data_type, bytes) = self.store.retrieve(id, subscript.as_deref(), mode)?;
        if subscript.is_none() {
            self.cache.store(id, data_type, bytes.clone());
        }
        Ok((data_type, bytes))
    }

    fn handle_peer(&mut self, src: Rank, msg: ServerMsg) -> Result<(), RunError> {
        match msg {
            ServerMsg::LoadSummary {
                counts,
                max_priority,
            } => {
                self.steal.note_summary(src, counts, max_priority);
                self.try_steal()
            }
            ServerMsg::StealRequest { wants, max_tasks } => {
                self.dirty = true;
                self.handle_steal_request(src, wants, max_tasks)
            }
            ServerMsg::StealResponse { tasks } => {
                self.dirty = true;
                self.handle_steal_response(src, tasks)
            }
            ServerMsg::Deliver { task } => {
                self.dirty = true;
                let seqno = self.wq.put_stolen(task);
                tracing::trace!(src, seqno, "task delivered from peer");
                Ok(())
            }
            ServerMsg::Token { sweep, clean } => self.handle_token(src, sweep, clean),
            ServerMsg::Shutdown => self.enter_shutdown(),
            ServerMsg::Abort { code } => {
                self.aborted = Some(code);
                self.answer_parked(Response::Shutdown)
            }
        }
    }

    /// Turn pending data-store events into CONTROL tasks (local put or
    /// peer delivery) and cache invalidations. Runs before the mutating
    /// RPC is acknowledged.
    pub(crate) fn flush_store_events(&mut self) -> Result<(), RunError> {
        for event in self.store.drain_events() {
            match event {
                Event::Notify {
                    rank,
                    id,
                    subscript,
                    event,
                } => {
                    let notification = Notification {
                        id,
                        subscript,
                        event,
                    };
                    tracing::trace!(rank, id, ?event, "notifying subscriber");
                    self.deliver_control(rank, notification.encode())?;
                }
                Event::Destroyed { id } => self.cache.invalidate(id),
            }
        }
        Ok(())
    }

    /// Enqueue a CONTROL task hard-targeted at `rank`, here or at the
    /// rank's own home server.
    fn deliver_control(&mut self, rank: Rank, payload: Bytes) -> Result<(), RunError> {
        let home = self.topology.home_server_of(rank);
        if home == self.comm.rank() {
            self.wq
                .put(
                    CONTROL,
                    NOTIFY_PRIORITY,
                    Target::rank(rank),
                    1,
                    self.comm.rank(),
                    payload,
                )
                .expect("notification task always queues");
            return Ok(());
        }
        let task = Task {
            seqno: 0,
            work_type: CONTROL,
            priority: NOTIFY_PRIORITY,
            parallelism: 1,
            target: Target::rank(rank),
            answer_rank: self.comm.rank(),
            home_server: home,
            pin_rank: None,
            payload,
        };
        self.send_server(home, &ServerMsg::Deliver { task })
    }

    pub(crate) fn reply(&mut self, dst: Rank, seq: u64, response: Response) -> Result<(), RunError> {
        let reply = Reply { seq, response };
        self.comm
            .send(dst, Tag::Reply, protocol::encode(&reply))
            .map_err(RunError::from)
    }

    pub(crate) fn send_server(&self, dst: Rank, msg: &ServerMsg) -> Result<(), RunError> {
        self.comm
            .send(dst, Tag::Server, protocol::encode(msg))
            .map_err(RunError::from)
    }

    pub(crate) fn peer_servers(&self) -> Vec<Rank> {
        let me = self.comm.rank();
        (0..self.topology.servers())
            .map(|i| self.topology.server_rank(i))
            .filter(|&r| r != me)
            .collect()
    }

    /// Answer every parked Get with `response` and clear the queue.
    pub(crate) fn answer_parked(&mut self, response: Response) -> Result<(), RunError> {
        for req in self.rq.drain() {
            if let Some(seq) = self.pending_get_seq.remove(&req.worker) {
                self.reply(req.worker, seq, response.clone())?;
            }
        }
        Ok(())
    }
}
