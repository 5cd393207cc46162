//! Port ranges and the named tiers that keep usage classes apart.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named usage class for a port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeTier {
    Development,
    SharedTest,
    DedicatedTest,
    Ci,
    Staging,
}

impl RangeTier {
    pub const ALL: [RangeTier; 5] = [
        RangeTier::Development,
        RangeTier::SharedTest,
        RangeTier::DedicatedTest,
        RangeTier::Ci,
        RangeTier::Staging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeTier::Development => "development",
            RangeTier::SharedTest => "shared-test",
            RangeTier::DedicatedTest => "dedicated-test",
            RangeTier::Ci => "ci",
            RangeTier::Staging => "staging",
        }
    }

    /// Built-in interval for this tier.
    pub fn default_range(&self) -> PortRange {
        let (start, end) = match self {
            RangeTier::Development => (20000, 20999),
            RangeTier::SharedTest => (30000, 30999),
            RangeTier::DedicatedTest => (31000, 31999),
            RangeTier::Ci => (32000, 32999),
            RangeTier::Staging => (33000, 33999),
        };
        PortRange {
            start,
            end,
            tier: Some(*self),
        }
    }
}

impl fmt::Display for RangeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RangeTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "development" | "dev" => Ok(RangeTier::Development),
            "shared-test" => Ok(RangeTier::SharedTest),
            "dedicated-test" => Ok(RangeTier::DedicatedTest),
            "ci" => Ok(RangeTier::Ci),
            "staging" => Ok(RangeTier::Staging),
            _ => Err(Error::UnknownTier(s.to_string())),
        }
    }
}

/// Closed port interval `[start, end]`, optionally tagged with its tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<RangeTier>,
}

impl PortRange {
    /// Build a validated range. Malformed ranges are programmer errors.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        let range = Self {
            start,
            end,
            tier: None,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn with_tier(mut self, tier: RangeTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.start == 0 {
            return Err(Error::InvalidRange {
                start: self.start,
                end: self.end,
                reason: "port 0 is not allocatable".to_string(),
            });
        }
        if self.start > self.end {
            return Err(Error::InvalidRange {
                start: self.start,
                end: self.end,
                reason: "start is greater than end".to_string(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end as usize) - (self.start as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tier {
            Some(tier) => write!(f, "{} {}-{}", tier, self.start, self.end),
            None => write!(f, "{}-{}", self.start, self.end),
        }
    }
}

/// Parses `"30000-30999"`.
impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::Parse(format!("Expected '<start>-<end>', got '{}'", s)))?;
        let start = start
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::Parse(format!("Invalid range start '{}': {}", start, e)))?;
        let end = end
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::Parse(format!("Invalid range end '{}': {}", end, e)))?;
        PortRange::new(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tiers_do_not_overlap() {
        for (i, a) in RangeTier::ALL.iter().enumerate() {
            for b in RangeTier::ALL.iter().skip(i + 1) {
                assert!(
                    !a.default_range().overlaps(&b.default_range()),
                    "{} overlaps {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn shared_test_tier_bounds() {
        let range = RangeTier::SharedTest.default_range();
        assert_eq!(range.start, 30000);
        assert_eq!(range.end, 30999);
        assert_eq!(range.len(), 1000);
        assert!(range.contains(30000));
        assert!(range.contains(30999));
        assert!(!range.contains(31000));
    }

    #[test]
    fn tier_parsing() {
        assert_eq!("shared-test".parse::<RangeTier>().unwrap(), RangeTier::SharedTest);
        assert_eq!("shared_test".parse::<RangeTier>().unwrap(), RangeTier::SharedTest);
        assert_eq!("CI".parse::<RangeTier>().unwrap(), RangeTier::Ci);
        assert!("production".parse::<RangeTier>().is_err());
    }

    #[test]
    fn range_parsing() {
        let range: PortRange = "40000-40010".parse().unwrap();
        assert_eq!(range.start, 40000);
        assert_eq!(range.end, 40010);
        assert_eq!(range.tier, None);
        assert!("40010-40000".parse::<PortRange>().is_err());
        assert!("0-10".parse::<PortRange>().is_err());
        assert!("nonsense".parse::<PortRange>().is_err());
    }

    #[test]
    fn single_port_range() {
        let range = PortRange::new(45000, 45000).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range.ports().collect::<Vec<_>>(), vec![45000]);
    }
}
