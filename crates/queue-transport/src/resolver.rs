//! Address to queue endpoint resolution.
//!
//! An address is either a bare queue name or an absolute `http`/`https`
//! endpoint URL. URLs are used as-is. Names are looked up through the backend
//! once and the result is cached for the lifetime of the resolver, keyed by the
//! lower-cased address.

use crate::backend::QueueBackend;
use crate::error::TransportError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;

/// Resolves addresses to queue endpoint URLs with a process-wide cache
#[derive(Debug, Clone, Default)]
pub struct AddressResolver {
    endpoints: Arc<RwLock<HashMap<String, String>>>,
}

impl AddressResolver {
    /// Create resolver with an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Check address syntax
    ///
    /// A bare name must not contain `/`. Anything containing `/` must be an
    /// absolute `http` or `https` URL with a host.
    pub fn validate(address: &str) -> Result<(), TransportError> {
        if address.trim().is_empty() {
            return Err(TransportError::argument("address", "must not be empty"));
        }

        if address.contains('/') && !Self::is_endpoint_url(address) {
            return Err(TransportError::AddressFormat {
                address: address.to_string(),
                message: "expected a queue name or an absolute http(s) URL".to_string(),
            });
        }

        Ok(())
    }

    /// Check whether the address is an absolute endpoint URL
    pub fn is_endpoint_url(address: &str) -> bool {
        Url::parse(address)
            .map(|url| {
                matches!(url.scheme(), "http" | "https")
                    && url.host_str().is_some_and(|host| !host.is_empty())
            })
            .unwrap_or(false)
    }

    /// Extract the queue name from an address
    ///
    /// For endpoint URLs the last non-empty path segment is the name.
    pub fn queue_name(address: &str) -> Result<String, TransportError> {
        Self::validate(address)?;
        if !Self::is_endpoint_url(address) {
            return Ok(address.to_string());
        }

        Url::parse(address)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                    .map(str::to_string)
            })
            .ok_or_else(|| TransportError::AddressFormat {
                address: address.to_string(),
                message: "endpoint URL has no queue name in its path".to_string(),
            })
    }

    /// Resolve an address to a queue endpoint URL
    ///
    /// Concurrent first lookups of the same name may each reach the backend;
    /// only one result is kept.
    ///
    /// # Errors
    /// Returns [`TransportError::Resolution`] if the backend cannot locate the queue.
    pub async fn resolve(
        &self,
        address: &str,
        backend: &dyn QueueBackend,
    ) -> Result<String, TransportError> {
        if Self::is_endpoint_url(address) {
            return Ok(address.to_string());
        }

        let key = address.to_lowercase();
        if let Some(url) = self.endpoints.read().await.get(&key) {
            return Ok(url.clone());
        }

        let url = backend
            .get_queue_url(address)
            .await
            .map_err(|source| TransportError::Resolution {
                address: address.to_string(),
                source,
            })?;
        debug!(address = %address, queue_url = %url, "Resolved queue endpoint");

        let mut endpoints = self.endpoints.write().await;
        Ok(endpoints.entry(key).or_insert(url).clone())
    }

    /// Number of cached endpoints
    pub async fn cached_len(&self) -> usize {
        self.endpoints.read().await.len()
    }
}
