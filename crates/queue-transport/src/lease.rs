//! Visibility lease of a received message.
//!
//! A lease keeps a received message invisible to other consumers while the
//! unit that received it is still working. A background task extends the
//! visibility timeout to the lease duration every `0.8 × lease duration`
//! until the lease reaches one terminal state:
//!
//! - **Acknowledged**: the message is deleted
//! - **Released**: the visibility timeout is set to zero so the message is
//!   redelivered right away
//! - **Disposed**: renewal stops and the message reappears once its current
//!   visibility timeout runs out
//!
//! Reaching a terminal state always stops the renewal task and waits for it
//! first. Only the first terminal call has any effect.

use crate::backend::QueueBackend;
use crate::error::TransportError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Fraction of the lease duration after which the lease is renewed
const RENEWAL_FRACTION: f64 = 0.8;

// ============================================================================
// Lease Settings
// ============================================================================

/// Timing of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    lease_duration: Duration,
    renewal_interval: Duration,
}

impl LeaseSettings {
    /// Create settings for the given lease duration
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            lease_duration,
            renewal_interval: lease_duration.mul_f64(RENEWAL_FRACTION),
        }
    }

    /// Visibility timeout applied on receive and on every renewal
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Time between renewals
    pub fn renewal_interval(&self) -> Duration {
        self.renewal_interval
    }
}

// ============================================================================
// Lease
// ============================================================================

/// State of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Leased,
    Acknowledged,
    Released,
    Disposed,
}

/// Renewable visibility lease on one received message
pub struct Lease {
    backend: Arc<dyn QueueBackend>,
    queue_url: String,
    receipt_handle: String,
    message_id: String,
    settings: LeaseSettings,
    cancel: CancellationToken,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
    state: tokio::sync::Mutex<LeaseState>,
    renewals: Arc<AtomicUsize>,
}

impl Lease {
    /// Take a lease on a received message and start renewing it
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        backend: Arc<dyn QueueBackend>,
        queue_url: impl Into<String>,
        receipt_handle: impl Into<String>,
        message_id: impl Into<String>,
        settings: LeaseSettings,
    ) -> Arc<Self> {
        let lease = Arc::new(Self {
            backend,
            queue_url: queue_url.into(),
            receipt_handle: receipt_handle.into(),
            message_id: message_id.into(),
            settings,
            cancel: CancellationToken::new(),
            renewal_task: Mutex::new(None),
            state: tokio::sync::Mutex::new(LeaseState::Leased),
            renewals: Arc::new(AtomicUsize::new(0)),
        });

        let task = tokio::spawn(renew_until_cancelled(RenewalJob {
            backend: Arc::clone(&lease.backend),
            queue_url: lease.queue_url.clone(),
            receipt_handle: lease.receipt_handle.clone(),
            message_id: lease.message_id.clone(),
            settings,
            cancel: lease.cancel.clone(),
            renewals: Arc::clone(&lease.renewals),
        }));
        *lease
            .renewal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        debug!(
            message_id = %lease.message_id,
            lease_secs = settings.lease_duration.as_secs_f64(),
            renewal_secs = settings.renewal_interval.as_secs_f64(),
            "Lease started"
        );
        lease
    }

    /// Backend id of the leased message
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Receipt handle the lease renews
    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    /// Lease timing
    pub fn settings(&self) -> LeaseSettings {
        self.settings
    }

    /// Number of successful renewals so far
    pub fn renewal_count(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Current state
    pub async fn state(&self) -> LeaseState {
        *self.state.lock().await
    }

    /// Stop renewing and delete the message
    pub async fn acknowledge(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if *state != LeaseState::Leased {
            return Ok(());
        }
        *state = LeaseState::Acknowledged;
        self.stop_renewal().await;

        self.backend
            .delete_message(&self.queue_url, &self.receipt_handle)
            .await
            .map_err(|e| e.into_transport_error("delete message", &self.queue_url))?;
        debug!(message_id = %self.message_id, "Message acknowledged");
        Ok(())
    }

    /// Stop renewing and make the message visible again immediately
    pub async fn release(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if *state != LeaseState::Leased {
            return Ok(());
        }
        *state = LeaseState::Released;
        self.stop_renewal().await;

        self.backend
            .change_message_visibility(&self.queue_url, &self.receipt_handle, Duration::ZERO)
            .await
            .map_err(|e| e.into_transport_error("release message", &self.queue_url))?;
        debug!(message_id = %self.message_id, "Message released");
        Ok(())
    }

    /// Stop renewing and leave the message to its current visibility timeout
    pub async fn dispose(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if *state != LeaseState::Leased {
            return Ok(());
        }
        *state = LeaseState::Disposed;
        self.stop_renewal().await;
        debug!(message_id = %self.message_id, "Lease disposed");
        Ok(())
    }

    async fn stop_renewal(&self) {
        self.cancel.cancel();
        let task = self
            .renewal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(message_id = %self.message_id, error = %e, "Lease renewal task ended abnormally");
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("message_id", &self.message_id)
            .field("queue_url", &self.queue_url)
            .field("settings", &self.settings)
            .field("renewals", &self.renewal_count())
            .finish()
    }
}

// ============================================================================
// Renewal Task
// ============================================================================

struct RenewalJob {
    backend: Arc<dyn QueueBackend>,
    queue_url: String,
    receipt_handle: String,
    message_id: String,
    settings: LeaseSettings,
    cancel: CancellationToken,
    renewals: Arc<AtomicUsize>,
}

async fn renew_until_cancelled(job: RenewalJob) {
    loop {
        tokio::select! {
            _ = job.cancel.cancelled() => break,
            _ = tokio::time::sleep(job.settings.renewal_interval) => {}
        }

        match job
            .backend
            .change_message_visibility(
                &job.queue_url,
                &job.receipt_handle,
                job.settings.lease_duration,
            )
            .await
        {
            Ok(()) => {
                let count = job.renewals.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(message_id = %job.message_id, renewals = count, "Lease renewed");
            }
            Err(source) => {
                let error = TransportError::LeaseRenewal {
                    message_id: job.message_id.clone(),
                    source,
                };
                warn!(error = %error, "Lease renewal failed; retrying next interval");
            }
        }
    }
}
