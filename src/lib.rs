//! # portlease
//!
//! Hands out exclusive TCP port leases to test runs, dev sessions and CI jobs
//! that run side by side on one host, possibly in unrelated processes.
//!
//! ## Features
//!
//! - **Cross-process uniqueness**: a shared on-disk table guarded by an
//!   advisory file lock is the single source of truth
//! - **Idempotent leases**: asking again for the same `(environment, service)`
//!   returns the same port while it is still bindable
//! - **Predictable ports**: services prefer `tier start + offset` before a
//!   randomized search of the range
//! - **Partial success**: an exhausted range fails only the services it could
//!   not satisfy, with a retry hint
//! - **Leak reaping**: old leases whose owner died are reclaimed; locked leases
//!   never are
//!
//! ## Quick Start
//!
//! ```no_run
//! use portlease::{Config, PortAllocator};
//!
//! # fn example() -> Result<(), portlease::Error> {
//! let config = Config::default();
//! let allocator = PortAllocator::new("ci-job-1234", &config)?;
//!
//! let result = allocator.allocate_ports(&["backend", "postgres"], false)?;
//! if result.success {
//!     println!("backend on {}", result.ports["backend"]);
//! }
//!
//! allocator.release_ports::<&str>(None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Limits
//!
//! A lease records that a port was free when probed; it does not hold the
//! socket. A process outside the allocator can still bind the port before the
//! consumer does, so consumers should retry their own bind on failure.

pub mod config;
pub mod error;
pub mod port;

pub use config::{Config, Parser};
pub use error::{Error, Result};
pub use port::{
    is_port_available, AllocationRequestResult, AllocationStats, AllocationStore,
    PortAllocation, PortAllocator, PortProbe, PortRange, RangeTier,
};
