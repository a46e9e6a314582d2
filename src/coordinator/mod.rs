//! # Coordinators
//!
//! Which chaos cells may route writes for cards, and the shortcut RPCs
//! that hand out and take back that permission one era at a time.
//!
//! Suspending or resuming a coordinator changes the coordinator view of
//! every card, so it is versioned through the era mechanism like any
//! topology change.

mod cells;
mod transport;

pub use cells::{CoordinatorCell, CoordinatorManager, CoordinatorState};
pub use transport::{
    CoordinatorTransport, GrantShortcutsRequest, GrantShortcutsResponse,
    LocalCoordinatorTransport,
};
