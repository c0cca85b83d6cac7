use datastore::Store;
use protocol::{DatumId, Rank};

/// Topology is the split of the world communicator: ranks
/// `0..workers` run tasks, ranks `workers..world` run servers.
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    world: u32,
    servers: u32,
}

impl Topology {
    pub fn new(world: u32, servers: u32) -> Topology {
        assert!(servers > 0 && servers < world);
        Topology { world, servers }
    }

    pub fn world(&self) -> u32 {
        self.world
    }

    pub fn servers(&self) -> u32 {
        self.servers
    }

    pub fn workers(&self) -> u32 {
        self.world - self.servers
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.workers()
    }

    /// A server rank's index among servers.
    pub fn server_index(&self, rank: Rank) -> u32 {
        debug_assert!(self.is_server(rank));
        rank - self.workers()
    }

    pub fn server_rank(&self, index: u32) -> Rank {
        debug_assert!(index < self.servers);
        self.workers() + index
    }

    /// The server a worker sends its task requests to.
    pub fn home_server_of(&self, worker: Rank) -> Rank {
        debug_assert!(!self.is_server(worker));
        self.server_rank(worker % self.servers)
    }

    /// The server owning a datum id.
    pub fn data_server_of(&self, id: DatumId) -> Rank {
        self.server_rank(Store::home_of(id, self.servers))
    }

    /// The workers homed at the server with index `index`.
    pub fn workers_of(&self, index: u32) -> impl Iterator<Item = Rank> + '_ {
        let servers = self.servers;
        (0..self.workers()).filter(move |w| w % servers == index)
    }

    /// The next server around the termination ring.
    pub fn next_server(&self, rank: Rank) -> Rank {
        self.server_rank((self.server_index(rank) + 1) % self.servers)
    }
}
