use crate::output::UserOutput;
use portlease::PortAllocator;

pub fn run_release(
    allocator: &PortAllocator,
    services: &[String],
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let filter = (!services.is_empty()).then_some(services);
    let released = allocator.release_ports(filter)?;

    if released == 0 {
        out.warning(&format!(
            "No leases to release for '{}'",
            allocator.environment_id()
        ));
    } else {
        out.status(&format!(
            "Released {} lease(s) for '{}'",
            released,
            allocator.environment_id()
        ));
    }
    Ok(())
}

/// Lock or unlock one lease. Exit code 1 when the lease does not exist.
pub fn run_set_locked(
    allocator: &PortAllocator,
    service: &str,
    locked: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<i32> {
    let found = if locked {
        allocator.lock_allocation(service)?
    } else {
        allocator.unlock_allocation(service)?
    };

    if !found {
        out.error(&format!(
            "No lease for '{}' in environment '{}'",
            service,
            allocator.environment_id()
        ));
        return Ok(1);
    }

    let verb = if locked { "Locked" } else { "Unlocked" };
    out.status(&format!("{} lease for '{}'", verb, service));
    Ok(0)
}
