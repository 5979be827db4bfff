//! Rate-limited channel client.
//!
//! One client per connection. Every call passes through a per-connection
//! gate: the credit check, any backoff wait and the outbound call happen
//! while the gate is held, so two callers never both pass a stale check.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use innsync_core::ConnectionId;

use super::credit::{BackoffTiers, CreditState};
use super::transport::{ChannelRequest, ChannelResponse, ChannelTransport, TransportError};

/// The channel refused work until its credit window resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("channel rate limit reached (remaining: {remaining}, resets in {resets_in_secs}s)")]
pub struct RateLimitError {
    pub remaining: i64,
    pub resets_in_secs: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
struct Observation {
    state: CreditState,
    at: Instant,
    /// The backoff owed for this observation has been waited out.
    backoff_served: bool,
}

impl Observation {
    fn window_left(&self) -> Duration {
        Duration::from_secs(self.state.resets_in_secs).saturating_sub(self.at.elapsed())
    }
}

pub struct RateLimitedClient {
    connection_id: ConnectionId,
    transport: Arc<dyn ChannelTransport>,
    tiers: BackoffTiers,
    call_timeout: Duration,
    gate: Mutex<()>,
    credit: RwLock<Option<Observation>>,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("connection_id", &self.connection_id)
            .field("tiers", &self.tiers)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    pub fn new(
        connection_id: ConnectionId,
        transport: Arc<dyn ChannelTransport>,
        tiers: BackoffTiers,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connection_id,
            transport,
            tiers,
            call_timeout,
            gate: Mutex::new(()),
            credit: RwLock::new(None),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn tiers(&self) -> &BackoffTiers {
        &self.tiers
    }

    /// Last observed credit state. Never waits on an in-flight call.
    pub fn credit_status(&self) -> Option<CreditState> {
        self.credit
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|o| o.state.clone())
    }

    /// Wait still owed before the next call, given the last observation.
    pub fn pending_backoff(&self) -> Duration {
        let credit = self.credit.read().unwrap_or_else(PoisonError::into_inner);
        match credit.as_ref() {
            Some(obs) if !obs.backoff_served => self
                .tiers
                .delay(obs.state.remaining, obs.state.resets_in_secs)
                .saturating_sub(obs.at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    fn exhausted(&self) -> Option<RateLimitError> {
        let credit = self.credit.read().unwrap_or_else(PoisonError::into_inner);
        let obs = credit.as_ref()?;
        let window_left = obs.window_left();
        (obs.state.remaining <= 0 && !window_left.is_zero()).then(|| RateLimitError {
            remaining: obs.state.remaining,
            resets_in_secs: window_left.as_secs().max(1),
        })
    }

    fn mark_backoff_served(&self) {
        let mut credit = self.credit.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(obs) = credit.as_mut() {
            obs.backoff_served = true;
        }
    }

    fn observe(&self, response: &ChannelResponse) -> CreditState {
        let state = CreditState::from_headers(&response.headers);
        let mut credit = self.credit.write().unwrap_or_else(PoisonError::into_inner);
        *credit = Some(Observation {
            state: state.clone(),
            at: Instant::now(),
            backoff_served: false,
        });
        state
    }

    /// Issue one call, honoring the credit state.
    pub async fn call(&self, request: ChannelRequest) -> Result<ChannelResponse, ChannelError> {
        let _gate = self.gate.lock().await;

        if let Some(err) = self.exhausted() {
            tracing::warn!(
                connection_id = %self.connection_id,
                remaining = err.remaining,
                resets_in_secs = err.resets_in_secs,
                "channel credits exhausted; refusing call"
            );
            return Err(err.into());
        }

        let wait = self.pending_backoff();
        if !wait.is_zero() {
            tracing::info!(
                connection_id = %self.connection_id,
                wait_ms = wait.as_millis() as u64,
                "backing off before channel call"
            );
            tokio::time::sleep(wait).await;
            self.mark_backoff_served();
        }

        let response = match tokio::time::timeout(self.call_timeout, self.transport.send(request)).await {
            Err(_) => return Err(TransportError::Timeout(self.call_timeout).into()),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(response)) => response,
        };

        let credit = self.observe(&response);
        tracing::debug!(
            connection_id = %self.connection_id,
            status = response.status,
            remaining = credit.remaining,
            cost = credit.last_request_cost,
            "channel credit observed"
        );

        if response.status == 429 {
            return Err(RateLimitError {
                remaining: credit.remaining.min(0),
                resets_in_secs: credit.resets_in_secs,
            }
            .into());
        }
        if response.status >= 400 {
            return Err(TransportError::Status {
                status: response.status,
                body: response.body.chars().take(512).collect(),
            }
            .into());
        }
        Ok(response)
    }
}
