//! Port leasing: probing, the shared allocation table, the allocation
//! engine and the reaper.

pub mod allocator;
pub mod lock;
pub mod operations;
pub mod preference;
pub mod prober;
pub mod process;
pub mod range;
pub mod reaper;
pub mod stats;
pub mod store;

pub use allocator::{AllocationRequestResult, PortAllocator};
pub use lock::ScopedLock;
pub use preference::{default_preferences, ServicePortPreference};
pub use prober::{is_port_available, PortProbe, TcpProber};
pub use process::is_process_alive;
pub use range::{PortRange, RangeTier};
pub use reaper::{ReapDecision, Reaper};
pub use stats::AllocationStats;
pub use store::{AllocationKey, AllocationStore, AllocationTable, PortAllocation};
