//! Bank Ledger Common Types
//!
//! Shared identifiers, monetary types and the error taxonomy used by the
//! ledger, the service layer and the simulator.

pub mod identifiers;
pub mod monetary;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
