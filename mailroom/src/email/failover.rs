//! Provider failover with a circuit breaker
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  threshold consecutive primary failures  ┌──────┐
//! │ Closed  │ ───────────────────────────────────────> │ Open │
//! └─────────┘                                          └──────┘
//!     ^                                                   │
//!     │        reset timeout elapsed since last failure   │
//!     └───────────────────────────────────────────────────┘
//! ```
//!
//! While closed every send tries the primary first; a primary failure falls
//! back to the secondary for that same request. While open the primary is
//! skipped entirely. Once the reset timeout has passed since the last primary
//! failure the circuit closes fully (there is no half-open probe) and the
//! primary gets traffic again.
//!
//! The breaker state sits behind one mutex that is only held for bookkeeping,
//! never across a provider call.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{EmailError, EmailProvider, OutboundEmail, SendReceipt};
use crate::config::CircuitBreakerSettings;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Primary receives traffic
    Closed,
    /// Primary is skipped until the reset timeout elapses
    Open,
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive primary failures since the last success or reset
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct BreakerData {
    failures: u32,
    open: bool,
    last_failure_at: Option<Instant>,
}

/// Sends through a primary provider with fallback to an optional secondary
///
/// Construct one per process and share it (`Arc<FailoverManager>`); the
/// breaker only works if every sender sees the same state.
pub struct FailoverManager {
    primary: Arc<dyn EmailProvider>,
    secondary: Option<Arc<dyn EmailProvider>>,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerData>,
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.as_ref().map(|s| s.name()))
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl FailoverManager {
    /// Create a manager with the default threshold (3) and reset timeout (60s)
    #[must_use]
    pub fn new(primary: Arc<dyn EmailProvider>, secondary: Option<Arc<dyn EmailProvider>>) -> Self {
        Self::with_settings(primary, secondary, &CircuitBreakerSettings::default())
    }

    /// Create a manager from configuration
    #[must_use]
    pub fn with_settings(
        primary: Arc<dyn EmailProvider>,
        secondary: Option<Arc<dyn EmailProvider>>,
        settings: &CircuitBreakerSettings,
    ) -> Self {
        Self {
            primary,
            secondary,
            failure_threshold: settings.failure_threshold.max(1),
            reset_timeout: settings.reset_timeout(),
            state: Mutex::new(BreakerData::default()),
        }
    }

    /// Label of the primary provider
    #[must_use]
    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    /// Current breaker state
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            state: if state.open {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            consecutive_failures: state.failures,
        }
    }

    /// Send `email`, failing over to the secondary when needed
    ///
    /// # Errors
    ///
    /// - `EmailError::NoSecondaryProvider` when the primary failed or is
    ///   skipped and no secondary is configured
    /// - the secondary's error when both providers fail
    pub async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, EmailError> {
        if !self.primary_allowed() {
            debug!(primary = %self.primary.name(), "Circuit open, skipping primary");
            return self.send_with_secondary(email, None).await;
        }

        match self.primary.send(email).await {
            Ok(receipt) => {
                self.record_success();
                Ok(receipt)
            }
            Err(e) => {
                self.record_failure(&e);
                self.send_with_secondary(email, Some(e)).await
            }
        }
    }

    /// Decide whether the primary may be tried, closing an expired circuit
    fn primary_allowed(&self) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return true;
        }

        let expired = state
            .last_failure_at
            .is_some_and(|at| at.elapsed() > self.reset_timeout);
        if expired {
            state.open = false;
            state.failures = 0;
            warn!(primary = %self.primary.name(), "Circuit breaker RESET, trying primary");
        }
        expired
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        if state.failures > 0 {
            debug!(primary = %self.primary.name(), previous_failures = state.failures, "Primary recovered");
        }
        state.failures = 0;
    }

    fn record_failure(&self, err: &EmailError) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.last_failure_at = Some(Instant::now());

        error!(
            primary = %self.primary.name(),
            failures = state.failures,
            threshold = self.failure_threshold,
            error = %err,
            "Primary provider failed"
        );

        if state.failures >= self.failure_threshold && !state.open {
            state.open = true;
            warn!(
                primary = %self.primary.name(),
                reset_timeout_secs = self.reset_timeout.as_secs(),
                "Circuit breaker OPEN, routing to secondary"
            );
        }
    }

    async fn send_with_secondary(
        &self,
        email: &OutboundEmail,
        primary_error: Option<EmailError>,
    ) -> Result<SendReceipt, EmailError> {
        let Some(secondary) = &self.secondary else {
            warn!("No secondary provider configured");
            return Err(EmailError::NoSecondaryProvider {
                primary_reason: primary_error.map(|e| e.failure_reason()),
            });
        };

        info!(secondary = %secondary.name(), "Using secondary provider");
        secondary.send(email).await.inspect_err(|e| {
            error!(secondary = %secondary.name(), error = %e, "Secondary provider failed");
        })
    }
}
