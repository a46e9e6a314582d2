//! # Card Manager
//!
//! Registry of the replication cards hosted by a chaos cell and the
//! management operations on them: cards, replicas, progress reports,
//! era acknowledgements and history expiry.
//!
//! The card is the unit of locking. Requests for one card are serialized
//! by its lock; requests for different cards are independent.

mod card_manager;
mod registry;
mod table_nodes;

pub use card_manager::{
    ChaosManager, CreateCardRequest, CreateReplicaRequest, ManagerOptions,
    DEFAULT_MAX_REPLICAS_PER_CARD,
};
pub use registry::{CardEntry, CardRegistry, EraStatus};
pub use table_nodes::{TableNode, TableNodeRegistry};
