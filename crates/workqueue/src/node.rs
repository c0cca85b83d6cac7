use protocol::Rank;

/// NodeMap records which node each rank runs on, supplied at init.
/// Node-accurate targeting widens a rank target to its whole node.
#[derive(Debug, Clone)]
pub struct NodeMap {
    nodes: Vec<u32>,
}

impl NodeMap {
    /// Every rank on its own node: node targeting degenerates to rank
    /// targeting. The default when no map is supplied.
    pub fn distinct(world: u32) -> NodeMap {
        NodeMap {
            nodes: (0..world).collect(),
        }
    }

    /// All ranks share one node.
    pub fn single_node(world: u32) -> NodeMap {
        NodeMap {
            nodes: vec![0; world as usize],
        }
    }

    pub fn from_nodes(nodes: Vec<u32>) -> NodeMap {
        NodeMap { nodes }
    }

    pub fn node_of(&self, rank: Rank) -> u32 {
        self.nodes[rank as usize]
    }

    pub fn same_node(&self, a: Rank, b: Rank) -> bool {
        self.node_of(a) == self.node_of(b)
    }
}
