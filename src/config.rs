use chrono::{FixedOffset, Offset, Utc};
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;

use crate::models::Money;
use crate::services::lifecycle::BookingPolicy;

/// Upper bound for `cancellation_window_hours` (one year).
pub const MAX_CANCELLATION_WINDOW_HOURS: i64 = 24 * 365;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    // Pricing (minor currency units)
    pub platform_fee_per_match: i64,

    // Booking policy
    pub cancellation_window_hours: i64,
    pub require_approved_field: bool,
    pub utc_offset_minutes: i32,
    pub opening_hour: u32,
    pub closing_hour: u32,

    // Orphaned hold reconciliation
    pub hold_timeout_secs: u64,
    pub sweep_schedule: String,

    // Hosted checkout payment processor (simulated gateway when absent)
    pub gateway: Option<GatewayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub api_url: String,
    pub merchant_id: String,
    pub merchant_key: Secret<String>,
    pub merchant_salt: Secret<String>,
    pub test_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("platform_fee_per_match", 5000)?
            .set_default("cancellation_window_hours", 72)?
            .set_default("require_approved_field", true)?
            .set_default("utc_offset_minutes", 180)?
            .set_default("opening_hour", 9)?
            .set_default("closing_hour", 24)?
            .set_default("hold_timeout_secs", 5)?
            .set_default("sweep_schedule", "*/30 * * * * *")?
            .set_default("gateway_test_mode", false)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let gateway = match config.get::<String>("gateway_api_url").ok() {
            Some(api_url) => Some(GatewayConfig {
                api_url,
                merchant_id: config.get("gateway_merchant_id")?,
                merchant_key: Secret::new(config.get("gateway_merchant_key")?),
                merchant_salt: Secret::new(config.get("gateway_merchant_salt")?),
                test_mode: config.get("gateway_test_mode")?,
            }),
            None => None,
        };

        let parsed = Self {
            database_url: config.get("database_url")?,
            platform_fee_per_match: config.get("platform_fee_per_match")?,
            cancellation_window_hours: config.get("cancellation_window_hours")?,
            require_approved_field: config.get("require_approved_field")?,
            utc_offset_minutes: config.get("utc_offset_minutes")?,
            opening_hour: config.get("opening_hour")?,
            closing_hour: config.get("closing_hour")?,
            hold_timeout_secs: config.get("hold_timeout_secs")?,
            sweep_schedule: config.get("sweep_schedule")?,
            gateway,
        };

        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.platform_fee_per_match < 0 {
            return Err(config::ConfigError::Message(
                "platform_fee_per_match must not be negative".to_string(),
            ));
        }
        if !(0..=MAX_CANCELLATION_WINDOW_HOURS).contains(&self.cancellation_window_hours) {
            return Err(config::ConfigError::Message(format!(
                "cancellation_window_hours must be within 0..={MAX_CANCELLATION_WINDOW_HOURS}, got {}",
                self.cancellation_window_hours
            )));
        }
        if self.opening_hour >= self.closing_hour || self.closing_hour > 24 {
            return Err(config::ConfigError::Message(format!(
                "invalid opening hours {}..{}",
                self.opening_hour, self.closing_hour
            )));
        }
        if FixedOffset::east_opt(self.utc_offset_minutes * 60).is_none() {
            return Err(config::ConfigError::Message(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_timeout_secs)
    }

    /// Policy values handed to the booking service at construction.
    pub fn booking_policy(&self) -> Result<BookingPolicy, config::ConfigError> {
        self.validate()?;

        let cancellation_window = chrono::Duration::try_hours(self.cancellation_window_hours)
            .ok_or_else(|| {
                config::ConfigError::Message(format!(
                    "cancellation_window_hours overflows: {}",
                    self.cancellation_window_hours
                ))
            })?;

        Ok(BookingPolicy {
            platform_fee_per_match: Money::from_minor(self.platform_fee_per_match),
            cancellation_window,
            require_approved_field: self.require_approved_field,
            local_offset: FixedOffset::east_opt(self.utc_offset_minutes * 60)
                .unwrap_or_else(|| Utc.fix()),
            opening_hour: self.opening_hour,
            closing_hour: self.closing_hour,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/slotbook".to_string(),
            platform_fee_per_match: 5000,
            cancellation_window_hours: 72,
            require_approved_field: true,
            utc_offset_minutes: 180,
            opening_hour: 9,
            closing_hour: 24,
            hold_timeout_secs: 5,
            sweep_schedule: "*/30 * * * * *".to_string(),
            gateway: None,
        }
    }

    #[test]
    fn test_defaults_build_policy() {
        let policy = config().booking_policy().unwrap();

        assert_eq!(policy.cancellation_window, chrono::Duration::hours(72));
        assert_eq!(policy.platform_fee_per_match, Money::from_minor(5000));
        assert_eq!(policy.local_offset.local_minus_utc(), 3 * 3600);
        assert_eq!((policy.opening_hour, policy.closing_hour), (9, 24));
    }

    #[test]
    fn test_zero_cancellation_window_is_accepted() {
        let config = Config {
            cancellation_window_hours: 0,
            ..config()
        };

        assert!(config.validate().is_ok());
        assert_eq!(
            config.booking_policy().unwrap().cancellation_window,
            chrono::Duration::zero()
        );
    }

    #[test]
    fn test_negative_cancellation_window_is_rejected() {
        let config = Config {
            cancellation_window_hours: -1,
            ..config()
        };

        assert!(config.validate().is_err());
        assert!(config.booking_policy().is_err());
    }

    #[test]
    fn test_oversized_cancellation_window_is_rejected() {
        for hours in [MAX_CANCELLATION_WINDOW_HOURS + 1, i64::MAX] {
            let config = Config {
                cancellation_window_hours: hours,
                ..config()
            };

            assert!(config.validate().is_err());
            assert!(config.booking_policy().is_err());
        }

        let at_bound = Config {
            cancellation_window_hours: MAX_CANCELLATION_WINDOW_HOURS,
            ..config()
        };
        assert!(at_bound.booking_policy().is_ok());
    }

    #[test]
    fn test_invalid_opening_hours_are_rejected() {
        let config = Config {
            opening_hour: 22,
            closing_hour: 8,
            ..config()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_fee_is_rejected() {
        let config = Config {
            platform_fee_per_match: -1,
            ..config()
        };

        assert!(config.validate().is_err());
    }
}
