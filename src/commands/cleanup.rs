use crate::output::UserOutput;
use portlease::PortAllocator;

pub fn run_cleanup(
    allocator: &PortAllocator,
    max_age_hours: f64,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let removed = allocator.cleanup_expired_allocations(max_age_hours)?;

    if removed == 0 {
        out.status("No expired leases.");
    } else {
        out.status(&format!(
            "Removed {} lease(s) older than {}h",
            removed, max_age_hours
        ));
    }
    Ok(())
}
