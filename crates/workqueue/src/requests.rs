use crate::NodeMap;
use protocol::{Accuracy, Error, Rank, Result, Strictness, Task, WorkRequest, WorkType};
use std::collections::{BTreeMap, HashMap};

/// RequestQueue stores one server's idle worker requests, FIFO by arrival.
/// Requests carry no priority; ordering among equal matches is by rq_seqno.
/// A worker has at most one outstanding request at a time.
pub struct RequestQueue {
    types: Vec<WorkType>,
    next_seqno: u64,
    /// BTreeMap keyed by rq_seqno, so iteration is FIFO.
    entries: BTreeMap<u64, WorkRequest>,
    by_worker: HashMap<Rank, u64>,
    /// Count of queued requests accepting each type.
    counts: HashMap<WorkType, usize>,
}

impl RequestQueue {
    pub fn new(types: Vec<WorkType>) -> RequestQueue {
        RequestQueue {
            types,
            next_seqno: 1,
            entries: BTreeMap::new(),
            by_worker: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_worker(&self, worker: Rank) -> bool {
        self.by_worker.contains_key(&worker)
    }

    /// Queued requests accepting `work_type`; drives steal decisions.
    pub fn count(&self, work_type: WorkType) -> usize {
        self.counts.get(&work_type).copied().unwrap_or(0)
    }

    pub fn push(
        &mut self,
        worker: Rank,
        accept_types: Vec<WorkType>,
        blocking: bool,
    ) -> Result<u64> {
        if accept_types.is_empty() {
            return Err(Error::Invalid("empty accept set".to_owned()));
        }
        for &t in &accept_types {
            if t != protocol::ANY_TYPE && !self.types.contains(&t) {
                return Err(Error::Invalid(format!("undeclared work type {t}")));
            }
        }
        if self.by_worker.contains_key(&worker) {
            return Err(Error::Invalid(format!(
                "worker {worker} already has an outstanding request"
            )));
        }

        let rq_seqno = self.next_seqno;
        self.next_seqno += 1;
        let req = WorkRequest {
            worker,
            rq_seqno,
            accept_types,
            blocking,
        };
        self.index(&req);
        self.by_worker.insert(worker, rq_seqno);
        self.entries.insert(rq_seqno, req);
        Ok(rq_seqno)
    }

    /// Re-queue a request consumed by a parallel cohort that was abandoned.
    /// Its original rq_seqno is preserved, so it resumes its FIFO place.
    pub fn reinstate(&mut self, req: WorkRequest) {
        assert!(
            !self.by_worker.contains_key(&req.worker),
            "worker {} already has an outstanding request",
            req.worker
        );
        self.index(&req);
        self.by_worker.insert(req.worker, req.rq_seqno);
        self.entries.insert(req.rq_seqno, req);
    }

    fn index(&mut self, req: &WorkRequest) {
        for &t in &self.types {
            if req.accepts(t) {
                *self.counts.entry(t).or_insert(0) += 1;
            }
        }
    }

    fn unindex(&mut self, req: &WorkRequest) {
        for &t in &self.types {
            if req.accepts(t) {
                let count = self.counts.get_mut(&t).expect("indexed count exists");
                *count -= 1;
            }
        }
    }

    pub fn pop_by_seqno(&mut self, rq_seqno: u64) -> Option<WorkRequest> {
        let req = self.entries.remove(&rq_seqno)?;
        self.by_worker.remove(&req.worker);
        self.unindex(&req);
        Some(req)
    }

    pub fn pop_by_worker(&mut self, worker: Rank) -> Option<WorkRequest> {
        let rq_seqno = self.by_worker.get(&worker).copied()?;
        self.pop_by_seqno(rq_seqno)
    }

    /// The request that should receive `task`: the oldest eligible one,
    /// except that a soft target prefers its targeted rank (or node) when
    /// such a request is waiting.
    pub fn find_matching(&self, task: &Task, nodes: &NodeMap) -> Option<u64> {
        let mut fallback = None;
        for (&rq_seqno, req) in &self.entries {
            if !req.accepts(task.work_type) {
                continue;
            }
            match rank_fit(task, req.worker, nodes) {
                Fit::Preferred => return Some(rq_seqno),
                Fit::Eligible => fallback = fallback.or(Some(rq_seqno)),
                Fit::No => (),
            }
        }
        fallback
    }

    /// FIFO iteration over queued requests.
    pub fn iter(&self) -> impl Iterator<Item = &WorkRequest> {
        self.entries.values()
    }

    /// Remove and return every queued request. Used when quiescence is
    /// confirmed and all parked Gets are answered Shutdown.
    pub fn drain(&mut self) -> Vec<WorkRequest> {
        self.by_worker.clear();
        self.counts.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

enum Fit {
    Preferred,
    Eligible,
    No,
}

fn rank_fit(task: &Task, worker: Rank, nodes: &NodeMap) -> Fit {
    let Some(rank) = task.target.rank else {
        return Fit::Eligible;
    };
    let hits = match task.target.accuracy {
        Accuracy::Rank => worker == rank,
        Accuracy::Node => nodes.same_node(worker, rank),
    };
    match (hits, task.target.strictness) {
        (true, _) => Fit::Preferred,
        (false, Strictness::Soft) => Fit::Eligible,
        (false, Strictness::Hard) => Fit::No,
    }
}
