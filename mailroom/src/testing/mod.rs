//! Testing utilities
//!
//! Provides scripted providers and instrumented builders for exercising the
//! delivery pipeline without real infrastructure.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::email::{EmailError, EmailProvider, OutboundEmail, SendReceipt};
use crate::template::{MiniJinjaBuilder, TemplateBuilder, TemplateError};

/// Provider whose outcomes are scripted in advance
///
/// Each send pops the next scripted outcome; once the script is exhausted the
/// fallback outcome is used. Every message handed to the provider is recorded.
///
/// # Examples
///
/// ```rust
/// use mailroom::email::{EmailProvider, OutboundEmail};
/// use mailroom::testing::ScriptedProvider;
///
/// # async fn example() {
/// let provider = ScriptedProvider::with_script("smtp", [Err("SMTP timeout"), Ok(())]);
/// let email = OutboundEmail::new("a@example.com", "b@example.com", "Hi", "<p>Hi</p>");
///
/// assert!(provider.send(&email).await.is_err());
/// assert!(provider.send(&email).await.is_ok());
/// assert_eq!(provider.calls(), 2);
/// # }
/// ```
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<(), String>>>,
    fallback: Result<(), String>,
    sent: Mutex<Vec<OutboundEmail>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Provider that accepts every message
    #[must_use]
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::new(name.into(), VecDeque::new(), Ok(()))
    }

    /// Provider that rejects every message with `reason`
    #[must_use]
    pub fn failing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(name.into(), VecDeque::new(), Err(reason.into()))
    }

    /// Provider following `script`, then succeeding
    #[must_use]
    pub fn with_script<'a>(
        name: impl Into<String>,
        script: impl IntoIterator<Item = Result<(), &'a str>>,
    ) -> Self {
        let script = script
            .into_iter()
            .map(|outcome| outcome.map_err(str::to_string))
            .collect();
        Self::new(name.into(), script, Ok(()))
    }

    fn new(name: String, script: VecDeque<Result<(), String>>, fallback: Result<(), String>) -> Self {
        Self {
            name,
            script: Mutex::new(script),
            fallback,
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of send attempts
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages accepted so far
    #[must_use]
    pub fn accepted(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, EmailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            Ok(()) => {
                self.sent.lock().push(email.clone());
                Ok(SendReceipt {
                    provider_message_id: format!("{}-{}", self.name, Uuid::new_v4().simple()),
                    provider: self.name.clone(),
                })
            }
            Err(reason) => Err(EmailError::send_failed(&self.name, reason)),
        }
    }
}

/// Minijinja builder that counts builds and can be slowed down
///
/// The delay widens the race window when checking that concurrent resolves
/// compile a template only once.
#[derive(Debug, Default)]
pub struct CountingBuilder {
    inner: MiniJinjaBuilder,
    delay: Duration,
    builds: AtomicUsize,
}

impl CountingBuilder {
    /// Builder with no artificial delay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder that sleeps for `delay` before compiling
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Number of builds performed
    #[must_use]
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateBuilder for CountingBuilder {
    async fn build(
        &self,
        name: &str,
        source: &str,
        fingerprint: &str,
        dest: &Path,
    ) -> Result<(), TemplateError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.build(name, source, fingerprint, dest).await
    }
}
