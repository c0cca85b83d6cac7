use crate::server::{RunError, Server};
use protocol::{Response, ServerMsg};
use transport::Comm;

/// Termination detection: a two-phase token around the server ring.
///
/// A server is locally quiet when it holds no tasks, no assembling
/// cohorts, no outstanding steals, no undrained notifications, and every
/// worker homed on it is parked in a blocking Get or has finalized. The
/// ring leader circulates a token while quiet; any server that saw
/// activity since the token last passed dirties it. Two consecutive clean
/// sweeps prove no message was in flight either, and the leader declares
/// quiescence: every parked Get is answered Shutdown.
impl<C: Comm> Server<C> {
    pub(crate) fn is_locally_quiet(&self) -> bool {
        let index = self.topology.server_index(self.comm.rank());
        self.wq.is_empty()
            && self.cohorts.is_empty()
            && self.steal.outstanding == 0
            && !self.store.has_events()
            && self
                .topology
                .workers_of(index)
                .all(|w| self.rq.contains_worker(w) || self.finalized.contains(&w))
    }

    fn is_ring_leader(&self) -> bool {
        self.topology.server_index(self.comm.rank()) == 0
    }

    /// Called from the idle path, with the inbox drained.
    pub(crate) fn begin_quiescence_checks(&mut self) -> Result<(), RunError> {
        if self.shutdown || self.aborted.is_some() || !self.is_locally_quiet() {
            return Ok(());
        }
        if self.topology.servers() == 1 {
            return self.confirm_quiescence();
        }
        if self.is_ring_leader() && !self.token_in_flight {
            self.launch_token()?;
        }
        Ok(())
    }

    fn launch_token(&mut self) -> Result<(), RunError> {
        self.token_in_flight = true;
        self.dirty = false;
        let sweep = self.clean_sweeps as u64 + 1;
        tracing::trace!(sweep, "termination token launched");
        let next = self.topology.next_server(self.comm.rank());
        self.send_server(next, &ServerMsg::Token { sweep, clean: true })
    }

    pub(crate) fn handle_token(
        &mut self,
        _src: u32,
        sweep: u64,
        clean: bool,
    ) -> Result<(), RunError> {
        if self.shutdown || self.aborted.is_some() {
            return Ok(());
        }
        if !self.is_ring_leader() {
            self.held_token = Some((sweep, clean));
            return self.forward_held_token();
        }

        // The token came home.
        self.token_in_flight = false;
        let verdict = clean && self.is_locally_quiet() && !self.dirty;
        self.dirty = false;
        if verdict {
            self.clean_sweeps += 1;
        } else {
            self.clean_sweeps = 0;
        }
        tracing::trace!(sweep, verdict, sweeps = self.clean_sweeps, "token returned");
        if self.clean_sweeps >= 2 {
            self.confirm_quiescence()
        } else if self.is_locally_quiet() {
            self.launch_token()
        } else {
            // Relaunched from the idle path once quiet again.
            Ok(())
        }
    }

    /// A non-leader holds a token while busy and passes it on once quiet.
    pub(crate) fn forward_held_token(&mut self) -> Result<(), RunError> {
        let Some((sweep, clean)) = self.held_token else {
            return Ok(());
        };
        if self.shutdown || self.aborted.is_some() {
            self.held_token = None;
            return Ok(());
        }
        if !self.is_locally_quiet() {
            return Ok(());
        }
        self.held_token = None;
        let verdict = clean && !self.dirty;
        self.dirty = false;
        let next = self.topology.next_server(self.comm.rank());
        self.send_server(next, &ServerMsg::Token { sweep, clean: verdict })
    }

    fn confirm_quiescence(&mut self) -> Result<(), RunError> {
        tracing::info!(rank = self.comm.rank(), "quiescence confirmed");
        for peer in self.peer_servers() {
            self.send_server(peer, &ServerMsg::Shutdown)?;
        }
        self.enter_shutdown()
    }

    /// Quiescence was declared (here or by the leader): answer every
    /// parked Get with Shutdown. Later Gets answer Shutdown immediately.
    pub(crate) fn enter_shutdown(&mut self) -> Result<(), RunError> {
        self.shutdown = true;
        self.held_token = None;
        self.answer_parked(Response::Shutdown)
    }
}
