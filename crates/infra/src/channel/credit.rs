//! Channel credit telemetry and the backoff policy derived from it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

pub const HEADER_REQUEST_COST: &str = "x-request-cost";
pub const HEADER_CREDITS_REMAINING: &str = "x-credits-remaining";
pub const HEADER_CREDITS_RESET: &str = "x-credits-reset";

/// Credit state reported by the most recent channel response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditState {
    pub remaining: i64,
    pub resets_in_secs: u64,
    pub last_request_cost: u32,
    pub observed_at: DateTime<Utc>,
}

impl CreditState {
    pub const DEFAULT_COST: u32 = 1;
    pub const DEFAULT_REMAINING: i64 = 1000;
    pub const DEFAULT_RESETS_IN_SECS: u64 = 3600;

    /// Read the credit headers; each missing or unparseable header falls back
    /// to its default independently.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        fn header<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        }

        Self {
            remaining: header(headers, HEADER_CREDITS_REMAINING).unwrap_or(Self::DEFAULT_REMAINING),
            resets_in_secs: header(headers, HEADER_CREDITS_RESET)
                .unwrap_or(Self::DEFAULT_RESETS_IN_SECS),
            last_request_cost: header(headers, HEADER_REQUEST_COST).unwrap_or(Self::DEFAULT_COST),
            observed_at: Utc::now(),
        }
    }
}

/// One backoff step: applies when `remaining < below`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffTier {
    pub below: i64,
    /// Share of the reset window to wait.
    pub fraction: f64,
    pub cap_secs: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid backoff tiers: {0}")]
pub struct BackoffConfigError(pub String);

/// Credit-based backoff policy. The strictest tier whose threshold the
/// remaining credit is under wins; above every threshold there is no delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffTiers {
    pub tiers: Vec<BackoffTier>,
}

impl Default for BackoffTiers {
    fn default() -> Self {
        Self {
            tiers: vec![
                BackoffTier {
                    below: 50,
                    fraction: 0.10,
                    cap_secs: 5 * 60,
                },
                BackoffTier {
                    below: 25,
                    fraction: 0.50,
                    cap_secs: 15 * 60,
                },
                BackoffTier {
                    below: 10,
                    fraction: 1.0,
                    cap_secs: 30 * 60,
                },
            ],
        }
    }
}

impl BackoffTiers {
    /// Delay owed before the next call.
    pub fn delay(&self, remaining: i64, resets_in_secs: u64) -> Duration {
        let Some(tier) = self
            .tiers
            .iter()
            .filter(|t| remaining < t.below)
            .min_by_key(|t| t.below)
        else {
            return Duration::ZERO;
        };

        let window_ms = resets_in_secs.saturating_mul(1000) as f64;
        let scaled = (window_ms * tier.fraction).round() as u64;
        Duration::from_millis(scaled.min(tier.cap_secs.saturating_mul(1000)))
    }

    /// Pause applied to a connection after a rate-limit error: the strictest
    /// tier's delay for the reported window.
    pub fn rate_limit_pause(&self, resets_in_secs: u64) -> Duration {
        self.delay(i64::MIN, resets_in_secs)
    }

    /// Thresholds must be distinct and positive, fractions in (0, 1], and a
    /// lower threshold may never wait less than a higher one.
    pub fn validate(&self) -> Result<(), BackoffConfigError> {
        let mut tiers: Vec<&BackoffTier> = self.tiers.iter().collect();
        tiers.sort_by(|a, b| b.below.cmp(&a.below));

        for tier in &tiers {
            if tier.below <= 0 {
                return Err(BackoffConfigError(format!(
                    "threshold {} must be positive",
                    tier.below
                )));
            }
            if !(tier.fraction > 0.0 && tier.fraction <= 1.0) {
                return Err(BackoffConfigError(format!(
                    "fraction {} for threshold {} must be in (0, 1]",
                    tier.fraction, tier.below
                )));
            }
        }

        for pair in tiers.windows(2) {
            let (looser, stricter) = (pair[0], pair[1]);
            if looser.below == stricter.below {
                return Err(BackoffConfigError(format!(
                    "duplicate threshold {}",
                    looser.below
                )));
            }
            if stricter.fraction < looser.fraction || stricter.cap_secs < looser.cap_secs {
                return Err(BackoffConfigError(format!(
                    "tier below {} waits less than tier below {}",
                    stricter.below, looser.below
                )));
            }
        }
        Ok(())
    }
}
