//! Property tests: whatever sequence of requests arrives, no port is ever
//! leased twice and every lease stays inside the range it was requested in.

use portlease::port::{AllocationStore, PortAllocator, PortProbe, PortRange};
use portlease::Config;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

struct AllFree;

impl PortProbe for AllFree {
    fn is_available(&self, _port: u16, _host: &str) -> bool {
        true
    }
}

const SERVICES: &[&str] = &[
    "backend", "frontend", "auth", "postgres", "redis", "worker", "search",
];

#[derive(Debug, Clone)]
enum Operation {
    Allocate { env: usize, services: Vec<usize> },
    Release { env: usize },
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (0..4usize, prop::collection::vec(0..SERVICES.len(), 1..5))
            .prop_map(|(env, services)| Operation::Allocate { env, services }),
        1 => (0..4usize).prop_map(|env| Operation::Release { env }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_leases_are_unique_and_in_range(
        start in 45000u16..46000,
        width in 0u16..12,
        ops in prop::collection::vec(operation_strategy(), 1..20),
    ) {
        let dir = TempDir::new().unwrap();
        let range = PortRange::new(start, start + width).unwrap();
        let config = Config {
            state_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let allocators: Vec<PortAllocator> = (0..4)
            .map(|i| {
                PortAllocator::new(format!("env-{}", i), &config)
                    .unwrap()
                    .with_prober(Arc::new(AllFree))
                    .with_default_range(range)
                    .unwrap()
            })
            .collect();

        for op in &ops {
            match op {
                Operation::Allocate { env, services } => {
                    let names: Vec<&str> = services.iter().map(|i| SERVICES[*i]).collect();
                    let requested: HashSet<&str> = names.iter().copied().collect();
                    let result = allocators[*env].allocate_ports(&names, false).unwrap();

                    prop_assert_eq!(
                        result.ports.len() + result.failed_services.len(),
                        requested.len()
                    );
                    prop_assert_eq!(result.success, result.failed_services.is_empty());
                    for port in result.ports.values() {
                        prop_assert!(range.contains(*port));
                    }
                    if !result.success {
                        prop_assert!(result.retry_after.is_some());
                    }
                }
                Operation::Release { env } => {
                    allocators[*env].release_ports::<&str>(None).unwrap();
                }
            }

            let table = AllocationStore::new(dir.path()).snapshot().unwrap();
            let mut seen = HashSet::new();
            for lease in table.iter() {
                prop_assert!(seen.insert(lease.port), "port {} leased twice", lease.port);
                prop_assert!(range.contains(lease.port));
            }
            prop_assert!(table.len() <= range.len());
        }
    }
}
