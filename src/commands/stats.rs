use portlease::PortAllocator;

pub fn run_stats(allocator: &PortAllocator, json: bool) -> anyhow::Result<()> {
    let stats = allocator.allocation_stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("\nPort Leases");
    println!("===========\n");
    println!("  Total:  {}", stats.total);
    println!("  Locked: {}", stats.locked);

    for (title, counts) in [
        ("By environment", &stats.per_environment),
        ("By tier", &stats.per_range_tier),
        ("By service", &stats.per_service),
    ] {
        if counts.is_empty() {
            continue;
        }
        println!("\n{}:", title);
        for (name, count) in counts {
            println!("  {:>5}  {}", count, name);
        }
    }
    println!();

    Ok(())
}

pub fn run_list(allocator: &PortAllocator, mine: bool, json: bool) -> anyhow::Result<()> {
    let mut leases = allocator.list_allocations()?;
    if mine {
        leases.retain(|a| a.environment_id == allocator.environment_id());
    }
    leases.sort_by_key(|a| a.port);

    if json {
        println!("{}", serde_json::to_string_pretty(&leases)?);
        return Ok(());
    }

    if leases.is_empty() {
        println!("No ports are currently leased.");
        return Ok(());
    }

    println!(
        "  {:>5}  {:<20} {:<24} {:>8}  {}",
        "PORT", "SERVICE", "ENVIRONMENT", "PID", "ALLOCATED"
    );
    for lease in &leases {
        let pid = lease
            .owner_process_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let lock_marker = if lease.is_locked { " (locked)" } else { "" };
        println!(
            "  {:>5}  {:<20} {:<24} {:>8}  {}{}",
            lease.port,
            lease.service_name,
            lease.environment_id,
            pid,
            lease.allocated_at.format("%Y-%m-%d %H:%M:%S"),
            lock_marker
        );
    }

    Ok(())
}
