//! Wire-level types for the load balancer core: address matching,
//! identifiers, configuration DTOs, and the statistics schema. Analogous
//! to `turn-server-codec` in the teacher repo — low-level, parsing-ish,
//! and free of any data-plane logic.

pub mod addr_set;
pub mod config;
pub mod error;
pub mod identifiers;
pub mod ip;
pub mod stats;

pub use addr_set::AddressSet;
pub use error::{Error, Result};
pub use identifiers::{Protocol, RealIdentifier, RelativeRealIdentifier, VsIdentifier};
