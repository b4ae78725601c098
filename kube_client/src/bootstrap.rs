//! Capturing the identity used to mint new credentials

use bytes::Bytes;
use reqwest::Method;

use crate::{AuthSource, CallError, Connection};

/// A point-in-time copy of a connection's authentication
///
/// The snapshot is taken once and never changes afterwards. Calls made
/// through it authenticate with the captured identity, regardless of what the
/// connection has attached since. In particular, a provider attached after the
/// snapshot was taken is never consulted, even when that provider is the one
/// making the call.
#[derive(Clone, Debug)]
pub struct BootstrapSnapshot {
    source: AuthSource,
}

impl BootstrapSnapshot {
    /// Captures the connection's current authentication
    pub fn capture(connection: &Connection) -> Self {
        let source = connection.auth_source();
        tracing::trace!(source = ?source, "captured bootstrap authentication");
        Self { source }
    }

    /// The captured authentication
    pub fn source(&self) -> &AuthSource {
        &self.source
    }

    /// Performs one call on `connection` authenticated with the captured identity
    pub async fn call(
        &self,
        connection: &Connection,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, CallError> {
        connection
            .call_with_auth(self.source.clone(), method, path, body)
            .await
    }
}
