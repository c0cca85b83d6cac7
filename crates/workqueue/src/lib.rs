//! Per-server task and request storage: the work queue of pending tasks,
//! the request queue of idle workers, and the rank-to-node map used for
//! node-accurate targeting.

mod node;
mod requests;
mod work;

pub use node::NodeMap;
pub use requests::RequestQueue;
pub use work::WorkQueue;
