use crate::NodeMap;
use bytes::Bytes;
use protocol::{
    Accuracy, Error, Priority, Rank, Result, Strictness, Target, Task, WorkRequest, WorkType,
};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

/// Index key ordered best-first: highest priority, then oldest seqno.
type PrioKey = (Reverse<Priority>, u64);

fn key_of(task: &Task) -> PrioKey {
    (Reverse(task.priority), task.seqno)
}

/// WorkQueue stores one server's pending tasks with the access patterns the
/// matcher and steal engine need: by seqno, by type and priority, and by
/// target rank or node. Pinned tasks (parallel cohorts being assembled) are
/// unlinked from every index and reachable only by seqno.
pub struct WorkQueue {
    home: Rank,
    max_payload: usize,
    max_tasks: usize,
    next_seqno: u64,
    nodes: NodeMap,
    types: Vec<WorkType>,
    entries: HashMap<u64, Task>,
    /// Tasks any eligible rank may take: untargeted, plus soft-targeted
    /// tasks which are fallback-eligible for everyone.
    open: HashMap<WorkType, BTreeSet<PrioKey>>,
    /// Tasks preferring (soft) or requiring (hard) a specific rank.
    by_rank: HashMap<(Rank, WorkType), BTreeSet<PrioKey>>,
    /// Tasks preferring or requiring a node.
    by_node: HashMap<(u32, WorkType), BTreeSet<PrioKey>>,
}

impl WorkQueue {
    pub fn new(
        home: Rank,
        types: Vec<WorkType>,
        max_payload: usize,
        max_tasks: usize,
        nodes: NodeMap,
    ) -> WorkQueue {
        WorkQueue {
            home,
            max_payload,
            max_tasks,
            next_seqno: 1,
            nodes,
            types,
            entries: HashMap::new(),
            open: HashMap::new(),
            by_rank: HashMap::new(),
            by_node: HashMap::new(),
        }
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, seqno: u64) -> Option<&Task> {
        self.entries.get(&seqno)
    }

    /// Admit a task, stamping its seqno and home server.
    pub fn put(
        &mut self,
        work_type: WorkType,
        priority: Priority,
        target: Target,
        parallelism: u32,
        answer_rank: Rank,
        payload: Bytes,
    ) -> Result<u64> {
        if !self.types.contains(&work_type) {
            return Err(Error::Invalid(format!("undeclared work type {work_type}")));
        }
        if parallelism == 0 {
            return Err(Error::Invalid("parallelism must be positive".to_owned()));
        }
        if payload.len() > self.max_payload {
            return Err(Error::PayloadTooLarge {
                got: payload.len(),
                max: self.max_payload,
            });
        }
        if self.entries.len() >= self.max_tasks {
            return Err(Error::OutOfMemory);
        }

        let seqno = self.next_seqno;
        self.next_seqno += 1;
        let task = Task {
            seqno,
            work_type,
            priority,
            parallelism,
            target,
            answer_rank,
            home_server: self.home,
            pin_rank: None,
            payload,
        };
        tracing::trace!(seqno, work_type, priority, parallelism, "task admitted");
        self.link(&task);
        self.entries.insert(seqno, task);
        Ok(seqno)
    }

    /// Admit a task stolen from a peer. It gets a fresh local seqno and is
    /// re-homed here; pin state never survives a steal.
    pub fn put_stolen(&mut self, mut task: Task) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        task.seqno = seqno;
        task.home_server = self.home;
        task.pin_rank = None;
        self.link(&task);
        self.entries.insert(seqno, task);
        seqno
    }

    fn link(&mut self, task: &Task) {
        let key = key_of(task);
        let t = task.work_type;
        match task.target.rank {
            None => {
                self.open.entry(t).or_default().insert(key);
            }
            Some(rank) => {
                match task.target.accuracy {
                    Accuracy::Rank => {
                        self.by_rank.entry((rank, t)).or_default().insert(key);
                    }
                    Accuracy::Node => {
                        let node = self.nodes.node_of(rank);
                        self.by_node.entry((node, t)).or_default().insert(key);
                    }
                }
                if task.target.strictness == Strictness::Soft {
                    self.open.entry(t).or_default().insert(key);
                }
            }
        }
    }

    fn unlink(&mut self, task: &Task) {
        let key = key_of(task);
        let t = task.work_type;
        if let Some(set) = self.open.get_mut(&t) {
            set.remove(&key);
        }
        if let Some(rank) = task.target.rank {
            match task.target.accuracy {
                Accuracy::Rank => {
                    if let Some(set) = self.by_rank.get_mut(&(rank, t)) {
                        set.remove(&key);
                    }
                }
                Accuracy::Node => {
                    let node = self.nodes.node_of(rank);
                    if let Some(set) = self.by_node.get_mut(&(node, t)) {
                        set.remove(&key);
                    }
                }
            }
        }
    }

    /// The best task for this request, if any: highest priority wins; at
    /// equal priority a task pre-targeted at the requesting rank beats a
    /// node-targeted one beats an open one; remaining ties go to the
    /// oldest seqno. Returns the task's seqno without removing it.
    pub fn peek_for_request(&self, req: &WorkRequest) -> Option<u64> {
        let mut best: Option<(Priority, u8, u64)> = None;
        let node = self.nodes.node_of(req.worker);

        let mut consider = |set: Option<&BTreeSet<PrioKey>>, pref: u8| {
            let Some(&(Reverse(priority), seqno)) = set.and_then(|s| s.first()) else {
                return;
            };
            let better = match best {
                None => true,
                Some((bp, bpref, bseq)) => {
                    (priority, pref, Reverse(seqno)) > (bp, bpref, Reverse(bseq))
                }
            };
            if better {
                best = Some((priority, pref, seqno));
            }
        };

        for &t in &self.types {
            if !req.accepts(t) {
                continue;
            }
            consider(self.by_rank.get(&(req.worker, t)), 2);
            consider(self.by_node.get(&(node, t)), 1);
            consider(self.open.get(&t), 0);
        }
        best.map(|(_, _, seqno)| seqno)
    }

    /// Remove and return a task. Used to fulfil a match or a steal; on a
    /// racing claim only the holder's pop succeeds.
    pub fn pop_by_seqno(&mut self, seqno: u64) -> Option<Task> {
        let task = self.entries.remove(&seqno)?;
        if !task.pinned() {
            self.unlink(&task);
        }
        Some(task)
    }

    /// Reserve a task while its parallel cohort is assembled. The task
    /// leaves every index and cannot be matched or stolen until unpinned.
    pub fn pin(&mut self, seqno: u64, rank: Rank) {
        let task = self
            .entries
            .get(&seqno)
            .expect("pinned seqno must be queued")
            .clone();
        assert!(!task.pinned(), "task is already pinned");
        self.unlink(&task);
        self.entries.get_mut(&seqno).unwrap().pin_rank = Some(rank);
    }

    /// Return a pinned task to the general pool.
    pub fn unpin(&mut self, seqno: u64) {
        let task = {
            let task = self
                .entries
                .get_mut(&seqno)
                .expect("unpinned seqno must be queued");
            assert!(task.pinned(), "task is not pinned");
            task.pin_rank = None;
            task.clone()
        };
        self.link(&task);
    }

    /// Steal-eligible tasks of `work_type`: unpinned and not hard-targeted.
    pub fn count_available(&self, work_type: WorkType) -> usize {
        self.open.get(&work_type).map_or(0, |s| s.len())
    }

    /// Best priority among steal-eligible tasks of `work_type`.
    pub fn max_priority(&self, work_type: WorkType) -> Option<Priority> {
        let set = self.open.get(&work_type)?;
        set.first().map(|&(Reverse(p), _)| p)
    }

    /// Remove and return up to `max` steal-eligible tasks of `work_type`,
    /// best priority first. When `above` is set, only strictly better
    /// tasks are surrendered.
    pub fn steal_candidates(
        &mut self,
        work_type: WorkType,
        above: Option<Priority>,
        max: usize,
    ) -> Vec<Task> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(&(Reverse(priority), seqno)) =
                self.open.get(&work_type).and_then(|s| s.first())
            else {
                break;
            };
            if let Some(bound) = above {
                if priority <= bound {
                    break;
                }
            }
            out.push(self.pop_by_seqno(seqno).expect("indexed task is queued"));
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn queue() -> WorkQueue {
        WorkQueue::new(9, vec![0, 1], 1024, 64, NodeMap::distinct(10))
    }

    fn req(worker: Rank, accept: &[WorkType]) -> WorkRequest {
        WorkRequest {
            worker,
            rq_seqno: 1,
            accept_types: accept.to_vec(),
            blocking: true,
        }
    }

    fn put(q: &mut WorkQueue, t: WorkType, priority: Priority, target: Target) -> u64 {
        q.put(t, priority, target, 1, 0, Bytes::from_static(b"x"))
            .unwrap()
    }

    #[test]
    fn bounds_are_enforced() {
        let mut q = queue();
        let err = q
            .put(0, 0, Target::any(), 1, 0, Bytes::from(vec![0u8; 2048]))
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { got: 2048, .. }));

        assert!(matches!(
            q.put(7, 0, Target::any(), 1, 0, Bytes::new()),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn highest_priority_then_oldest() {
        let mut q = queue();
        let _low = put(&mut q, 0, 1, Target::any());
        let hi_a = put(&mut q, 0, 5, Target::any());
        let _hi_b = put(&mut q, 0, 5, Target::any());

        assert_eq!(q.peek_for_request(&req(3, &[0])), Some(hi_a));
    }

    #[test]
    fn targeted_beats_open_at_equal_priority() {
        let mut q = queue();
        let _open = put(&mut q, 0, 5, Target::any());
        let mine = put(&mut q, 0, 5, Target::rank(3));

        assert_eq!(q.peek_for_request(&req(3, &[0])), Some(mine));
        // A different rank cannot see the hard-targeted task at all.
        let other = q.peek_for_request(&req(4, &[0])).unwrap();
        assert_ne!(other, mine);
    }

    #[test]
    fn priority_beats_targeting() {
        let mut q = queue();
        let open = put(&mut q, 0, 9, Target::any());
        let _mine = put(&mut q, 0, 5, Target::rank(3));

        assert_eq!(q.peek_for_request(&req(3, &[0])), Some(open));
    }

    #[test]
    fn soft_target_is_open_to_others() {
        let mut q = queue();
        let soft = put(&mut q, 0, 5, Target::soft(3));
        assert_eq!(q.peek_for_request(&req(4, &[0])), Some(soft));

        // Taking it for rank 4 removes it everywhere.
        let task = q.pop_by_seqno(soft).unwrap();
        assert_eq!(task.seqno, soft);
        assert_eq!(q.peek_for_request(&req(3, &[0])), None);
    }

    #[test]
    fn node_targeting_widens_to_the_node() {
        let nodes = NodeMap::from_nodes(vec![0, 0, 1, 1]);
        let mut q = WorkQueue::new(3, vec![0], 1024, 64, nodes);
        let seqno = q
            .put(0, 0, Target::node(0), 1, 0, Bytes::new())
            .unwrap();

        // Rank 1 shares node 0 with the target.
        assert_eq!(q.peek_for_request(&req(1, &[0])), Some(seqno));
        // Rank 2 is on the other node.
        assert_eq!(q.peek_for_request(&req(2, &[0])), None);
    }

    #[test]
    fn wildcard_accept_sees_every_type() {
        let mut q = queue();
        let a = put(&mut q, 1, 3, Target::any());
        assert_eq!(q.peek_for_request(&req(2, &[protocol::ANY_TYPE])), Some(a));
    }

    #[test]
    fn pinned_tasks_leave_every_index() {
        let mut q = queue();
        let seqno = put(&mut q, 0, 5, Target::any());
        q.pin(seqno, 3);

        assert_eq!(q.peek_for_request(&req(4, &[0])), None);
        assert_eq!(q.count_available(0), 0);
        assert!(q.steal_candidates(0, None, 8).is_empty());

        q.unpin(seqno);
        assert_eq!(q.peek_for_request(&req(4, &[0])), Some(seqno));
    }

    #[test]
    fn steal_respects_the_priority_bound() {
        let mut q = queue();
        put(&mut q, 0, 1, Target::any());
        put(&mut q, 0, 5, Target::any());
        put(&mut q, 0, 9, Target::any());
        // Hard-targeted work is never surrendered.
        put(&mut q, 0, 99, Target::rank(1));

        let stolen = q.steal_candidates(0, Some(4), 8);
        let priorities: Vec<_> = stolen.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![9, 5]);
        assert_eq!(q.count_available(0), 1);
    }

    #[test]
    fn stolen_tasks_are_rehomed() {
        let mut q = queue();
        let seqno = put(&mut q, 0, 5, Target::any());
        let task = q.pop_by_seqno(seqno).unwrap();

        let mut thief = WorkQueue::new(4, vec![0, 1], 1024, 64, NodeMap::distinct(10));
        let new_seqno = thief.put_stolen(task);
        let task = thief.get(new_seqno).unwrap();
        assert_eq!(task.home_server, 4);
        assert_eq!(thief.peek_for_request(&req(2, &[0])), Some(new_seqno));
    }
}
