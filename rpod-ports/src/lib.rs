//! Network port management library.
//!
//! Provides port range parsing and the allocator that hands out externally
//! routable ports to sessions without colliding with live exposures.

pub mod allocator;
pub mod error;
pub mod range;

pub use allocator::{PortAllocator, PortClaim, PortUsage};
pub use error::PortError;
pub use range::PortRange;
