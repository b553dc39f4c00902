//! Per-unit backend connection.
//!
//! Every unit gets its own connection, opened on first use and closed when
//! the unit is disposed.

use crate::backend::{BackendConnector, QueueBackend};
use crate::error::TransportError;
use crate::unit::TransactionContext;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Lazily opened connection owned by one unit
pub struct UnitConnection {
    connector: Arc<dyn BackendConnector>,
    backend: Arc<OnceCell<Arc<dyn QueueBackend>>>,
}

impl UnitConnection {
    /// Get the connection of `unit` stored under `key`, attaching one if needed
    ///
    /// Attaching registers a disposal hook that closes the connection if it
    /// was ever opened.
    pub fn for_unit(
        unit: &TransactionContext,
        key: &str,
        connector: &Arc<dyn BackendConnector>,
    ) -> Result<Arc<Self>, TransportError> {
        unit.get_or_add(key, |unit| {
            let backend: Arc<OnceCell<Arc<dyn QueueBackend>>> = Arc::new(OnceCell::new());
            let to_close = Arc::clone(&backend);
            let unit_id = unit.id().to_string();
            unit.on_disposed(move || async move {
                match to_close.get() {
                    Some(backend) => {
                        debug!(unit_id = %unit_id, "Closing unit connection");
                        backend
                            .close()
                            .await
                            .map_err(|e| e.into_transport_error("close connection", &unit_id))
                    }
                    None => Ok(()),
                }
            });

            Self {
                connector: Arc::clone(connector),
                backend,
            }
        })
    }

    /// Get the backend, opening the connection on first call
    pub async fn backend(&self) -> Result<Arc<dyn QueueBackend>, TransportError> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                self.connector
                    .connect()
                    .await
                    .map_err(|e| e.into_transport_error("connect", "queue service"))
            })
            .await?;
        Ok(Arc::clone(backend))
    }

    /// Check whether the connection has been opened
    pub fn is_open(&self) -> bool {
        self.backend.initialized()
    }
}
