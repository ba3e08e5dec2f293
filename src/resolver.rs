//! Outcome resolution.
//!
//! Maps a requested status code and an optional fixture name to the status
//! and body the service answers with. A fixture that cannot be read is not
//! an error for the caller: it is reported on the [`EventSink`] and the body
//! falls back to `{"response":"<reason phrase>"}`.

use crate::fixture::{FixtureError, FixtureStore};
use axum::http::StatusCode;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Status code used when the request does not name one.
pub const DEFAULT_STATUS: i64 = 200;

/// The resolved response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusOutcome {
    pub status: StatusCode,
    pub reason: &'static str,
    pub body: String,
}

/// Resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The code is not a standard HTTP status.
    #[error("unknown HTTP status code: {0}")]
    UnknownStatus(i64),
}

/// Recoverable events raised while resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    /// A named fixture could not be read; the synthesized body was used instead.
    FixtureUnavailable {
        fixture: String,
        status: u16,
        error: String,
    },
}

/// Receiver for [`ResolverEvent`]s.
pub trait EventSink: Send + Sync {
    fn record(&self, event: ResolverEvent);
}

/// Emits events as `tracing` warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: ResolverEvent) {
        match event {
            ResolverEvent::FixtureUnavailable {
                fixture,
                status,
                error,
            } => {
                warn!(
                    fixture = %fixture,
                    status,
                    error = %error,
                    "Fixture unavailable, falling back to reason phrase body"
                );
            }
        }
    }
}

/// Keeps events in memory so they can be inspected later.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ResolverEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<ResolverEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: ResolverEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Look up a standard status code. Codes without a canonical reason phrase
/// are not considered standard. Informational (1xx) codes cannot end an HTTP
/// exchange, so they are refused as well.
pub fn standard_status(code: i64) -> Result<(StatusCode, &'static str), ResolveError> {
    u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .filter(|status| !status.is_informational())
        .and_then(|status| status.canonical_reason().map(|reason| (status, reason)))
        .ok_or(ResolveError::UnknownStatus(code))
}

/// The body returned when no fixture supplies one.
pub fn reason_body(reason: &str) -> String {
    serde_json::json!({ "response": reason }).to_string()
}

/// Decision engine turning request parameters into a [`StatusOutcome`].
#[derive(Clone)]
pub struct OutcomeResolver {
    fixtures: FixtureStore,
    events: Arc<dyn EventSink>,
}

impl OutcomeResolver {
    pub fn new(fixtures: FixtureStore, events: Arc<dyn EventSink>) -> Self {
        Self { fixtures, events }
    }

    /// Resolver reporting fallbacks through `tracing`.
    pub fn with_tracing(fixtures: FixtureStore) -> Self {
        Self::new(fixtures, Arc::new(TracingEventSink))
    }

    /// Resolve `code` and the optional fixture into a response.
    pub async fn resolve(
        &self,
        code: i64,
        fixture: Option<&str>,
    ) -> Result<StatusOutcome, ResolveError> {
        let (status, reason) = standard_status(code)?;

        let body = match fixture {
            None => reason_body(reason),
            Some(name) => match self.fixtures.read(name).await {
                Ok(content) => {
                    debug!(fixture = %name, status = code, "Serving fixture");
                    content
                }
                Err(e) => {
                    self.report_fallback(name, status.as_u16(), &e);
                    reason_body(reason)
                }
            },
        };

        Ok(StatusOutcome {
            status,
            reason,
            body,
        })
    }

    fn report_fallback(&self, fixture: &str, status: u16, error: &FixtureError) {
        self.events.record(ResolverEvent::FixtureUnavailable {
            fixture: fixture.to_string(),
            status,
            error: error.to_string(),
        });
    }
}
