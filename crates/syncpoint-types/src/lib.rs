pub mod error;
pub mod id;
pub mod state;

pub use error::{ErrorKind, Failure};
pub use id::{BarrierId, NodeId};
pub use state::NodeState;
