use super::range::PortRange;
use serde::{Deserialize, Serialize};

/// Static bias toward predictable port numbers for a logical service.
///
/// `base_port` is the service's conventional port (5432 for postgres) and is
/// used directly when a range happens to contain it. Otherwise the service
/// lands on `range.start + offset`, so e.g. backend is always the first port
/// of whatever tier it is allocated in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePortPreference {
    pub service_name: String,
    pub base_port: u16,
    pub offset: u16,
}

impl ServicePortPreference {
    pub fn new(service_name: impl Into<String>, base_port: u16, offset: u16) -> Self {
        Self {
            service_name: service_name.into(),
            base_port,
            offset,
        }
    }

    /// Preferred port for this service inside `range`, if any.
    pub fn preferred_port(&self, range: &PortRange) -> Option<u16> {
        if range.contains(self.base_port) {
            return Some(self.base_port);
        }
        range
            .start
            .checked_add(self.offset)
            .filter(|port| range.contains(*port))
    }
}

/// Built-in preferences for the services most environments run.
pub fn default_preferences() -> Vec<ServicePortPreference> {
    vec![
        ServicePortPreference::new("backend", 8000, 0),
        ServicePortPreference::new("frontend", 3000, 1),
        ServicePortPreference::new("auth", 8001, 2),
        ServicePortPreference::new("websocket", 8002, 3),
        ServicePortPreference::new("postgres", 5432, 10),
        ServicePortPreference::new("redis", 6379, 11),
        ServicePortPreference::new("mongodb", 27017, 12),
        ServicePortPreference::new("rabbitmq", 5672, 13),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::RangeTier;

    #[test]
    fn offset_applies_from_range_start() {
        let pref = ServicePortPreference::new("postgres", 5432, 10);
        let range = RangeTier::SharedTest.default_range();
        assert_eq!(pref.preferred_port(&range), Some(30010));
    }

    #[test]
    fn base_port_wins_when_in_range() {
        let pref = ServicePortPreference::new("postgres", 5432, 10);
        let range = PortRange::new(5000, 5999).unwrap();
        assert_eq!(pref.preferred_port(&range), Some(5432));
    }

    #[test]
    fn offset_outside_small_range() {
        let pref = ServicePortPreference::new("redis", 6379, 11);
        let range = PortRange::new(40000, 40004).unwrap();
        assert_eq!(pref.preferred_port(&range), None);
    }

    #[test]
    fn offset_overflow_is_none() {
        let pref = ServicePortPreference::new("edge", 1, 100);
        let range = PortRange::new(65500, 65535).unwrap();
        assert_eq!(pref.preferred_port(&range), None);
    }
}
