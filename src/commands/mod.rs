mod allocate;
mod check;
mod cleanup;
mod lease;
mod stats;

pub use allocate::{run_allocate, AllocateRequest};
pub use check::run_check;
pub use cleanup::run_cleanup;
pub use lease::{run_release, run_set_locked};
pub use stats::{run_list, run_stats};
