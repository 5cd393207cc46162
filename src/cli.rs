use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "portlease")]
#[command(about = "Lease exclusive ports to parallel test and dev environments")]
pub struct Cli {
    /// Config file path (defaults to portlease.yaml, searched upward)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Environment id owning the leases (defaults to $PORTLEASE_ENV_ID)
    #[arg(short, long = "env-id")]
    pub env_id: Option<String>,

    /// Directory holding the shared allocation table
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Allocate ports for services
    Allocate {
        /// Service names
        #[arg(required = true)]
        services: Vec<String>,

        /// Range tier (development, shared-test, dedicated-test, ci, staging)
        #[arg(short, long, conflicts_with = "range")]
        tier: Option<String>,

        /// Explicit range, e.g. 40000-40100
        #[arg(short, long)]
        range: Option<String>,

        /// Search upward from the preferred port instead of at random
        #[arg(long)]
        sequential: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Release leases (all of this environment's when no service is given)
    Release {
        services: Vec<String>,
    },
    /// Reclaim expired or orphaned leases
    Cleanup {
        /// Age threshold in hours (defaults to max_age_hours from config)
        #[arg(long)]
        max_age_hours: Option<f64>,
    },
    /// Protect a lease from cleanup
    Lock {
        service: String,
    },
    /// Make a lease eligible for cleanup again
    Unlock {
        service: String,
    },
    /// Show lease counts per environment, tier and service
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all leases
    List {
        /// Only this environment's leases
        #[arg(long)]
        mine: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a port can be bound right now
    Check {
        port: u16,

        /// Interface to probe
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}
