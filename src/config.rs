//! Configuration knobs recognized by the booking core.
//!
//! Loads tiered settings from env/TOML via the `config` crate, plus
//! `.env` support via `dotenvy` for local development.

pub use ::config::ConfigError;
use serde::{Deserialize, Serialize};

/// Brute-force lockout floor. The booking core does not enforce this
/// itself (auth is out of scope) but surfaces it so an embedding HTTP
/// layer can read a single source of configuration truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account_lockout_max_attempts: u32,
    pub account_lockout_duration_seconds: u64,

    /// REQUESTED -> EXPIRED threshold.
    pub request_expiry_hours: i64,

    /// ACTIVE -> ENDED grace period after `end`.
    pub session_end_grace_minutes: i64,

    /// Hold period for refund recovery at the payment provider.
    pub stripe_payout_delay_days: i64,

    /// Student cancellation full-refund cutoff, hours before start.
    pub cancellation_cutoff_hours: i64,

    /// Retention window for Processed-Webhook dedupe records.
    pub webhook_dedupe_retention_days: i64,

    /// Clock-skew warning threshold, seconds.
    pub clock_skew_warning_threshold_seconds: i64,

    /// Scheduler job retry backoff base, seconds.
    pub job_retry_base_seconds: u64,

    /// Scheduler job max attempts before dead-lettering.
    pub job_max_retries: u32,

    /// Minimum session duration, minutes.
    pub min_session_duration_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account_lockout_max_attempts: 5,
            account_lockout_duration_seconds: 15 * 60,
            request_expiry_hours: crate::REQUEST_EXPIRY_HOURS,
            session_end_grace_minutes: crate::SESSION_END_GRACE_MINUTES,
            stripe_payout_delay_days: 7,
            cancellation_cutoff_hours: crate::CANCELLATION_CUTOFF_HOURS,
            webhook_dedupe_retention_days: 30,
            clock_skew_warning_threshold_seconds: crate::DEFAULT_CLOCK_SKEW_THRESHOLD_SECONDS,
            job_retry_base_seconds: crate::JOB_RETRY_BASE_SECONDS,
            job_max_retries: crate::JOB_MAX_RETRIES,
            min_session_duration_minutes: crate::MIN_SESSION_DURATION_MINUTES,
        }
    }
}

impl Config {
    /// Load configuration layered as env > `booking-core.toml` > defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(::config::File::with_name("booking-core").required(false))
            .add_source(::config::Environment::with_prefix("BOOKING").separator("__"));

        builder.build()?.try_deserialize()
    }
}
