// depin-protocol: the coordination core shared by checker and worker nodes.
// Everything here is deterministic or purely local; ledger and network
// access live in depin-ledger and the node binaries.

pub mod aggregate;
pub mod brand;
pub mod cancel;
pub mod constants;
pub mod error;
pub mod hash;
pub mod payload;
pub mod period;
pub mod retry;
pub mod signature;

pub use brand::{assignment_set, is_eligible, AssignmentSet};
pub use constants::*;
pub use error::ProtocolError;
pub use period::{EpochClock, Period};
pub use signature::SignedPayload;
