//! # relay-id
//!
//! Typed identifiers used by the relay-mesos framework.
//!
//! Two families exist:
//!
//! - Identifiers minted locally (`TaskId`) are ULID-backed and carry a
//!   prefix: `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`. They sort by creation time.
//! - Identifiers minted by the cluster manager (`FrameworkId`, `OfferId`,
//!   `AgentId`) are opaque strings. Their format belongs to the manager, so
//!   the only check applied is that they are non-empty.
//!
//! Keeping both behind distinct newtypes stops an offer id from being passed
//! where an agent id is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
