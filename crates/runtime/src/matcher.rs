use crate::server::{RunError, Server};
use protocol::{ParallelGroup, Rank, Response, Task, TaskAssignment, WorkRequest};
use transport::Comm;

/// Cohort assembles the workers for one parallel task. The task sits
/// pinned in the work queue while members accumulate:
/// Unpinned -> Pinned(collected=1) -> Pinned(collected=k) -> Dispatched,
/// or back to Unpinned when assembly stalls too long.
pub(crate) struct Cohort {
    pub group_id: u64,
    pub need: usize,
    pub members: Vec<WorkRequest>,
    pub idle_rounds: u32,
}

impl<C: Comm> Server<C> {
    /// One matching pass: grow parallel cohorts, then pair queued tasks
    /// with queued requests until no pair remains. Runs on every WQ or
    /// RQ change.
    pub(crate) fn match_round(&mut self) -> Result<bool, RunError> {
        self.round += 1;
        let mut progressed = self.grow_cohorts()?;

        loop {
            let Some((rq_seqno, wq_seqno)) = self.find_pair() else {
                break;
            };
            progressed = true;
            self.dirty = true;

            let parallelism = self
                .wq
                .get(wq_seqno)
                .expect("matched task is queued")
                .parallelism;
            if parallelism == 1 {
                let task = self.wq.pop_by_seqno(wq_seqno).expect("matched task is queued");
                let req = self.rq.pop_by_seqno(rq_seqno).expect("matched request is queued");
                self.send_assignment(&req, &task, None)?;
            } else {
                let req = self.rq.pop_by_seqno(rq_seqno).expect("matched request is queued");
                self.wq.pin(wq_seqno, req.worker);
                let group_id = self.next_group;
                self.next_group += 1;
                tracing::debug!(
                    seqno = wq_seqno,
                    group_id,
                    parallelism,
                    first = req.worker,
                    "parallel task pinned"
                );
                self.cohorts.insert(
                    wq_seqno,
                    Cohort {
                        group_id,
                        need: parallelism as usize,
                        members: vec![req],
                        idle_rounds: 0,
                    },
                );
                self.grow_cohort(wq_seqno)?;
            }
        }
        Ok(progressed)
    }

    /// The oldest queued request with an eligible task, and its best task.
    fn find_pair(&self) -> Option<(u64, u64)> {
        for req in self.rq.iter() {
            if let Some(wq_seqno) = self.wq.peek_for_request(req) {
                return Some((req.rq_seqno, wq_seqno));
            }
        }
        None
    }

    fn grow_cohorts(&mut self) -> Result<bool, RunError> {
        let mut progressed = false;
        for seqno in self.cohorts.keys().copied().collect::<Vec<_>>() {
            progressed |= self.grow_cohort(seqno)?;
        }
        Ok(progressed)
    }

    /// Add waiting requests to one cohort; dispatch when complete, give
    /// the task back to the pool when assembly has stalled too long.
    fn grow_cohort(&mut self, seqno: u64) -> Result<bool, RunError> {
        let mut progressed = false;
        loop {
            let cohort = self.cohorts.get(&seqno).expect("cohort exists");
            if cohort.members.len() == cohort.need {
                break;
            }
            let task = self.wq.get(seqno).expect("pinned task is queued");
            let Some(rq_seqno) = self.rq.find_matching(task, self.wq.nodes()) else {
                break;
            };
            let req = self.rq.pop_by_seqno(rq_seqno).expect("matched request is queued");
            let cohort = self.cohorts.get_mut(&seqno).expect("cohort exists");
            cohort.members.push(req);
            cohort.idle_rounds = 0;
            progressed = true;
        }

        let cohort = self.cohorts.get_mut(&seqno).expect("cohort exists");
        if cohort.members.len() == cohort.need {
            let cohort = self.cohorts.remove(&seqno).expect("cohort exists");
            let task = self.wq.pop_by_seqno(seqno).expect("pinned task is queued");
            self.dispatch_cohort(task, cohort)?;
            return Ok(true);
        }
        if !progressed {
            cohort.idle_rounds += 1;
            if cohort.idle_rounds > self.cfg.cohort_rounds {
                let cohort = self.cohorts.remove(&seqno).expect("cohort exists");
                tracing::debug!(
                    seqno,
                    collected = cohort.members.len(),
                    need = cohort.need,
                    "cohort abandoned; task unpinned"
                );
                self.wq.unpin(seqno);
                for req in cohort.members {
                    self.rq.reinstate(req);
                }
                self.dirty = true;
            }
        }
        Ok(progressed)
    }

    fn dispatch_cohort(&mut self, task: Task, cohort: Cohort) -> Result<(), RunError> {
        let ranks: Vec<Rank> = cohort.members.iter().map(|m| m.worker).collect();
        tracing::debug!(
            seqno = task.seqno,
            group_id = cohort.group_id,
            ?ranks,
            "parallel task dispatched"
        );
        for (index, member) in cohort.members.iter().enumerate() {
            let group = ParallelGroup {
                group_id: cohort.group_id,
                member_index: index as u32,
                ranks: ranks.clone(),
            };
            self.send_assignment(member, &task, Some(group))?;
        }
        Ok(())
    }

    /// Hand a task to a matched worker. Ownership of the payload passes
    /// to the transport's outgoing buffer here.
    pub(crate) fn send_assignment(
        &mut self,
        req: &WorkRequest,
        task: &Task,
        parallel: Option<ParallelGroup>,
    ) -> Result<(), RunError> {
        let seq = self
            .pending_get_seq
            .remove(&req.worker)
            .expect("parked worker has a pending Get");
        tracing::trace!(
            worker = req.worker,
            seqno = task.seqno,
            work_type = task.work_type,
            "task assigned"
        );
        let assignment = TaskAssignment {
            work_type: task.work_type,
            answer_rank: task.answer_rank,
            payload: task.payload.clone(),
            parallel,
        };
        self.reply(req.worker, seq, Response::Task(assignment))
    }
}
