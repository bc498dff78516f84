//! SM token migration
//!
//! When a DLT moves a token to this node, the receiver copies the token's
//! metadata from the old primary (static snapshot, then delta), pulls the
//! bytes it lacks and only then opens the token for reads.

mod manager;
mod messages;
mod receiver;
mod sender;

pub use manager::TokenMigrationMgr;
pub use messages::{SmMigrationMsg, SmMigrationTransport, SyncPhase};
pub use receiver::{ReceiverEffect, ReceiverEvent, ReceiverState};
pub use sender::{SenderEffect, SenderEvent, SenderState};
