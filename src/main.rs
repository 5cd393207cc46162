mod cli;
mod commands;
mod output;

use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use portlease::config::{ENV_ID_ENV, TEST_ID_ENV};
use portlease::{Config, Error as LeaseError, Parser as ConfigParser, PortAllocator};

/// Exit code for an allocate call that left some services without a port.
const EXIT_RETRYABLE: i32 = 2;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(e) => {
            if let Some(lease_error) = e.downcast_ref::<LeaseError>() {
                eprintln!("Error: {}", lease_error.with_suggestion());
            } else {
                eprintln!("Error: {:#}", e);
            }
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_tracing();

    // ── Commands that need NO config ──────────────────────────────────
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
            return Ok(0);
        }
        Commands::Check { port, host } => {
            return commands::run_check(*port, host, &output::CliOutput);
        }
        _ => {}
    }

    // ── Load config ───────────────────────────────────────────────────
    let mut config = ConfigParser::new().load_or_default(cli.config.as_deref())?;
    config.state_dir_override = cli.state_dir.clone();

    // ── Commands that read the table without owning leases ────────────
    match &cli.command {
        Commands::Stats { json } => {
            let allocator = build_allocator(&config, "stats")?;
            return commands::run_stats(&allocator, *json).map(|_| 0);
        }
        Commands::List { mine: false, json } => {
            let allocator = build_allocator(&config, "list")?;
            return commands::run_list(&allocator, false, *json).map(|_| 0);
        }
        Commands::Cleanup { max_age_hours } => {
            let allocator = build_allocator(&config, "cleanup")?;
            let hours = max_age_hours.unwrap_or_else(|| config.max_age_hours());
            return commands::run_cleanup(&allocator, hours, &output::CliOutput).map(|_| 0);
        }
        _ => {}
    }

    // ── Commands acting on one environment ────────────────────────────
    match cli.command {
        Commands::Allocate {
            services,
            tier,
            range,
            sequential,
            json,
        } => {
            let env_id = resolve_env_id(cli.env_id, true)?;
            let allocator = build_allocator(&config, &env_id)?;
            let request = commands::AllocateRequest {
                services,
                tier,
                range,
                sequential,
                json,
            };
            let success = commands::run_allocate(&allocator, &request, &output::CliOutput)?;
            Ok(if success { 0 } else { EXIT_RETRYABLE })
        }
        Commands::Release { services } => {
            let env_id = resolve_env_id(cli.env_id, false)?;
            let allocator = build_allocator(&config, &env_id)?;
            commands::run_release(&allocator, &services, &output::CliOutput)?;
            Ok(0)
        }
        Commands::Lock { service } => {
            let env_id = resolve_env_id(cli.env_id, false)?;
            let allocator = build_allocator(&config, &env_id)?;
            commands::run_set_locked(&allocator, &service, true, &output::CliOutput)
        }
        Commands::Unlock { service } => {
            let env_id = resolve_env_id(cli.env_id, false)?;
            let allocator = build_allocator(&config, &env_id)?;
            commands::run_set_locked(&allocator, &service, false, &output::CliOutput)
        }
        Commands::List { mine: true, json } => {
            let env_id = resolve_env_id(cli.env_id, false)?;
            let allocator = build_allocator(&config, &env_id)?;
            commands::run_list(&allocator, true, json)?;
            Ok(0)
        }
        Commands::Stats { .. }
        | Commands::List { .. }
        | Commands::Cleanup { .. }
        | Commands::Check { .. }
        | Commands::Completions { .. } => unreachable!("handled above"),
    }
}

fn build_allocator(config: &Config, env_id: &str) -> anyhow::Result<PortAllocator> {
    let mut allocator = PortAllocator::new(env_id, config)?;
    if let Ok(test_id) = std::env::var(TEST_ID_ENV) {
        if !test_id.is_empty() {
            allocator = allocator.with_test_id(test_id);
        }
    }
    Ok(allocator)
}

/// `--env-id`, then `$PORTLEASE_ENV_ID`, then (only if `generate`) a fresh id.
fn resolve_env_id(flag: Option<String>, generate: bool) -> anyhow::Result<String> {
    if let Some(id) = flag.filter(|s| !s.trim().is_empty()) {
        return Ok(id);
    }
    if let Ok(id) = std::env::var(ENV_ID_ENV) {
        if !id.trim().is_empty() {
            return Ok(id);
        }
    }
    if generate {
        let id = generate_env_id();
        tracing::info!("No environment id given, using generated id '{}'", id);
        return Ok(id);
    }
    anyhow::bail!(
        "No environment id: pass --env-id or set ${}",
        ENV_ID_ENV
    )
}

fn generate_env_id() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let value: u64 = rng.gen();
    format!("env-{:016x}", value)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
