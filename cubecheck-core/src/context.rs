//! Request-scoped context for diagnostic runs.
//!
//! Each run carries its own correlation id and cancellation token, so
//! concurrent runs never share mutable state. Log lines emitted inside
//! [`DiagnosticContext::span`] carry the correlation id as a span field.

use crate::{DiagnosticError, Result};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// Correlation id and cancellation handle for one diagnostic run
#[derive(Debug, Clone)]
pub struct DiagnosticContext {
    correlation_id: String,
    started: Instant,
    cancellation: CancellationToken,
}

impl Default for DiagnosticContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticContext {
    /// Starts a run with a fresh correlation id and its own token
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Starts a run that stops when `cancellation` is triggered
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            cancellation,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Milliseconds since the run started
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Span carrying the correlation id
    pub fn span(&self) -> Span {
        tracing::info_span!("diagnostic_session", correlation_id = %self.correlation_id)
    }

    /// Fails with [`DiagnosticError::Cancelled`] once the run is cancelled.
    pub fn ensure_active(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(DiagnosticError::Cancelled {
                stage: stage.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Runs `stage`, abandoning it as soon as the run is cancelled.
    pub async fn run_stage<T, F>(&self, stage: &str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        self.ensure_active(stage)?;
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(DiagnosticError::Cancelled {
                stage: stage.to_string(),
            }),
            value = future => Ok(value),
        }
    }
}
