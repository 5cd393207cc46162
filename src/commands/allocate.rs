use crate::output::UserOutput;
use portlease::{AllocationRequestResult, PortAllocator, PortRange, RangeTier};

pub struct AllocateRequest {
    pub services: Vec<String>,
    pub tier: Option<String>,
    pub range: Option<String>,
    pub sequential: bool,
    pub json: bool,
}

/// Returns whether every service got a port.
pub fn run_allocate(
    allocator: &PortAllocator,
    request: &AllocateRequest,
    out: &dyn UserOutput,
) -> anyhow::Result<bool> {
    let result = match (&request.tier, &request.range) {
        (Some(tier), _) => {
            let tier: RangeTier = tier.parse()?;
            allocator.allocate_in_tier(&request.services, tier, request.sequential)?
        }
        (None, Some(range)) => {
            let range: PortRange = range.parse()?;
            allocator.allocate_in_range(&request.services, range, request.sequential)?
        }
        (None, None) => allocator.allocate_ports(&request.services, request.sequential)?,
    };

    if request.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, out);
    }

    Ok(result.success)
}

fn print_result(result: &AllocationRequestResult, out: &dyn UserOutput) {
    out.status(&format!("Environment: {}", result.environment_id));

    for (service, port) in &result.ports {
        out.status(&format!("  {:>5}  {}", port, service));
    }

    if !result.failed_services.is_empty() {
        out.blank();
        out.error(&format!(
            "Could not allocate: {}",
            result.failed_services.join(", ")
        ));
        if let Some(error) = &result.error {
            out.error(&format!("  {}", error));
        }
        if let Some(retry) = result.retry_after {
            out.warning(&format!("  Retry after {:.1}s", retry.as_secs_f64()));
        }
    }
}
