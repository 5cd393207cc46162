use super::Config;
use crate::error::{Error, Result};
use crate::port::range::RangeTier;

impl Config {
    /// Validate the configuration. Failures here are configuration mistakes,
    /// not runtime conditions, and should stop the caller.
    pub fn validate(&self) -> Result<()> {
        self.lock_timeout()?;
        self.retry_after()?;
        self.probe_timeout()?;

        if self.lock_timeout()?.is_zero() {
            return Err(Error::Validation(
                "'lock_timeout' must be greater than zero".to_string(),
            ));
        }
        if self.probe_timeout()?.is_zero() {
            return Err(Error::Validation(
                "'probe_timeout' must be greater than zero".to_string(),
            ));
        }

        let max_age = self.max_age_hours();
        if !max_age.is_finite() || max_age < 0.0 {
            return Err(Error::Validation(format!(
                "'max_age_hours' must be a non-negative number, got {}",
                max_age
            )));
        }

        if self.probe_host().trim().is_empty() {
            return Err(Error::Validation(
                "'probe_host' must not be empty".to_string(),
            ));
        }

        let ranges = RangeTier::ALL
            .iter()
            .map(|tier| self.require_range(*tier))
            .collect::<Result<Vec<_>>>()?;

        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(Error::Validation(format!(
                        "Port ranges overlap: {} and {}",
                        a, b
                    )));
                }
            }
        }

        for name in self.services.keys() {
            if name.trim().is_empty() {
                return Err(Error::Validation(
                    "Service names in 'services' must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RangeConfig, ServiceConfig};

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut config = Config::default();
        config
            .ranges
            .insert(RangeTier::Ci, RangeConfig { start: 30500, end: 30600 });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = Config::default();
        config
            .ranges
            .insert(RangeTier::Staging, RangeConfig { start: 34000, end: 33000 });
        assert!(matches!(
            config.validate().unwrap_err(),
            Error::InvalidRange { .. }
        ));
    }

    #[test]
    fn zero_probe_timeout_is_rejected() {
        let config = Config {
            probe_timeout: Some("0s".to_string()),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("probe_timeout"));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let config = Config {
            lock_timeout: Some("forever".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_max_age_is_rejected() {
        let config = Config {
            max_age_hours: Some(-1.0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_service_name_is_rejected() {
        let mut config = Config::default();
        config.services.insert(
            " ".to_string(),
            ServiceConfig {
                base_port: 9000,
                offset: 4,
            },
        );
        assert!(config.validate().is_err());
    }
}
