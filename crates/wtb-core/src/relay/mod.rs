//! Session/correlation manager: the part of the relay that holds state.

pub mod address;
pub mod commands;
pub mod correlation;
pub mod locks;
pub mod pending;
pub mod registry;
pub mod router;

pub use address::RemoteAddress;
pub use correlation::CorrelationTable;
pub use pending::{PendingSend, PendingSends};
pub use registry::{Session, SessionRegistry, SessionState};
pub use router::{CloseOutcome, RelayRouter};
