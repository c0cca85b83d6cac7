//! The runtime ties the pieces together: per-server progress loop and RPC
//! dispatch, the matcher and steal engine, termination detection, the
//! worker-side client, and job initialisation.

pub mod config;
mod matcher;
mod quiesce;
mod recover;
mod server;
mod steal;
mod topology;
mod worker;

pub use config::Config;
pub use recover::{recover, Decoded};
pub use server::{RunError, Server};
pub use topology::Topology;
pub use worker::Worker;

use protocol::{Error, Result, CONTROL};
use transport::Comm;

/// Role is what `init` hands back to a rank: the last `Config::servers`
/// ranks of the world run servers, everyone else is a worker.
pub enum Role<C: Comm> {
    Server(Server<C>),
    Worker(Worker<C>),
}

/// Collective job initialisation. Every rank of the world must call this
/// with an identical `Config`; it declares the job's task types and splits
/// the world into workers and servers.
pub fn init<C: Comm>(mut cfg: Config, comm: C) -> Result<Role<C>> {
    if cfg.servers == 0 {
        return Err(Error::Invalid("a job needs at least one server".to_owned()));
    }
    if cfg.servers >= comm.world() {
        return Err(Error::Invalid(format!(
            "{} servers leave no workers in a world of {}",
            cfg.servers,
            comm.world()
        )));
    }
    // CONTROL carries data-readiness notifications and is always declared.
    if !cfg.types.contains(&CONTROL) {
        cfg.types.insert(0, CONTROL);
    }
    let topology = Topology::new(comm.world(), cfg.servers);

    comm.barrier();

    if topology.is_server(comm.rank()) {
        Ok(Role::Server(Server::new(cfg, topology, comm)))
    } else {
        Ok(Role::Worker(Worker::new(cfg, topology, comm)))
    }
}
