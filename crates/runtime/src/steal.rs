use crate::config::Config;
use crate::server::{RunError, Server};
use protocol::{Priority, Rank, ServerMsg, Task, WorkType};
use std::collections::HashMap;
use transport::Comm;

/// What one peer last advertised.
#[derive(Debug, Default)]
struct Advertised {
    counts: HashMap<WorkType, usize>,
    max_priority: HashMap<WorkType, Priority>,
}

/// StealState is the thief-and-victim bookkeeping of one server.
pub(crate) struct StealState {
    summary_interval: usize,
    cooldown: u64,
    puts_since_summary: usize,
    /// The latest put hit a previously empty queue; advertise promptly.
    rising_edge: bool,
    summaries: HashMap<Rank, Advertised>,
    /// Outstanding steal requests; at most one at a time.
    pub(crate) outstanding: usize,
    /// Round at which this server last sent each type away.
    sent_away: HashMap<WorkType, u64>,
}

impl StealState {
    pub fn new(cfg: &Config) -> StealState {
        StealState {
            summary_interval: cfg.summary_interval.max(1),
            cooldown: cfg.steal_cooldown,
            puts_since_summary: 0,
            rising_edge: false,
            summaries: HashMap::new(),
            outstanding: 0,
            sent_away: HashMap::new(),
        }
    }

    pub fn note_put(&mut self, was_empty: bool) {
        self.puts_since_summary += 1;
        self.rising_edge |= was_empty;
    }

    fn summary_due(&self) -> bool {
        self.rising_edge || self.puts_since_summary >= self.summary_interval
    }

    pub fn note_summary(
        &mut self,
        peer: Rank,
        counts: Vec<(WorkType, usize)>,
        max_priority: Vec<(WorkType, Priority)>,
    ) {
        self.summaries.insert(
            peer,
            Advertised {
                counts: counts.into_iter().collect(),
                max_priority: max_priority.into_iter().collect(),
            },
        );
    }
}

impl<C: Comm> Server<C> {
    /// Advertise stealable work to peers when enough has accumulated
    /// since the last broadcast, or the queue just went non-empty.
    pub(crate) fn broadcast_summary_if_due(&mut self) -> Result<(), RunError> {
        if self.topology.servers() == 1 || !self.steal.summary_due() {
            return Ok(());
        }
        self.broadcast_summary()
    }

    pub(crate) fn broadcast_summary(&mut self) -> Result<(), RunError> {
        self.steal.puts_since_summary = 0;
        self.steal.rising_edge = false;
        let mut counts = Vec::new();
        let mut max_priority = Vec::new();
        for &t in &self.cfg.types {
            let count = self.wq.count_available(t);
            if count > 0 {
                counts.push((t, count));
                max_priority.push((t, self.wq.max_priority(t).expect("non-empty type")));
            }
        }
        tracing::trace!(?counts, "broadcasting load summary");
        let msg = ServerMsg::LoadSummary {
            counts,
            max_priority,
        };
        for peer in self.peer_servers() {
            self.send_server(peer, &msg)?;
        }
        Ok(())
    }

    /// Thief side: steal when local requests are unmet and a peer
    /// advertises matching work this server cannot beat locally.
    pub(crate) fn try_steal(&mut self) -> Result<(), RunError> {
        if self.steal.outstanding > 0 || self.shutdown || self.topology.servers() == 1 {
            return Ok(());
        }

        let mut victim: Option<Rank> = None;
        let mut wants: Vec<(WorkType, Option<Priority>)> = Vec::new();
        let mut unmet_total = 0;

        for &t in &self.cfg.types.clone() {
            let unmet = self.rq.count(t);
            if unmet == 0 {
                continue;
            }
            // Don't chase tasks this server itself just sent away.
            if let Some(&sent) = self.steal.sent_away.get(&t) {
                if self.round < sent + self.steal.cooldown {
                    continue;
                }
            }
            let local_best = self.wq.max_priority(t);
            for (&peer, advertised) in &self.steal.summaries {
                if victim.is_some_and(|v| v != peer) {
                    continue;
                }
                if advertised.counts.get(&t).copied().unwrap_or(0) == 0 {
                    continue;
                }
                // Steal only work strictly better than anything held
                // locally; any work at all if this type is dry here.
                let better = match local_best {
                    None => true,
                    Some(bound) => advertised
                        .max_priority
                        .get(&t)
                        .is_some_and(|&p| p > bound),
                };
                if better {
                    victim = Some(peer);
                    wants.push((t, local_best));
                    unmet_total += unmet;
                    break;
                }
            }
        }

        let Some(victim) = victim else {
            return Ok(());
        };
        tracing::debug!(victim, ?wants, unmet_total, "requesting steal");
        self.steal.outstanding += 1;
        self.send_server(
            victim,
            &ServerMsg::StealRequest {
                wants,
                max_tasks: unmet_total,
            },
        )
    }

    /// Victim side: surrender strictly-better unpinned tasks, reply, and
    /// re-advertise so peers stop acting on the stale summary.
    pub(crate) fn handle_steal_request(
        &mut self,
        thief: Rank,
        wants: Vec<(WorkType, Option<Priority>)>,
        max_tasks: usize,
    ) -> Result<(), RunError> {
        let mut tasks: Vec<Task> = Vec::new();
        for (t, bound) in wants {
            if tasks.len() >= max_tasks {
                break;
            }
            let taken = self.wq.steal_candidates(t, bound, max_tasks - tasks.len());
            if !taken.is_empty() {
                self.steal.sent_away.insert(t, self.round);
            }
            tasks.extend(taken);
        }
        tracing::debug!(thief, surrendered = tasks.len(), "steal request served");
        let any = !tasks.is_empty();
        self.send_server(thief, &ServerMsg::StealResponse { tasks })?;
        if any {
            self.broadcast_summary()?;
        }
        Ok(())
    }

    pub(crate) fn handle_steal_response(
        &mut self,
        victim: Rank,
        tasks: Vec<Task>,
    ) -> Result<(), RunError> {
        self.steal.outstanding -= 1;
        if tasks.is_empty() {
            // The summary was stale; drop it until the victim speaks again.
            self.steal.summaries.remove(&victim);
            return Ok(());
        }
        tracing::debug!(victim, stolen = tasks.len(), "tasks stolen");
        for task in tasks {
            self.wq.put_stolen(task);
        }
        // The progress loop matches next; look for more if still short.
        self.try_steal()
    }
}
