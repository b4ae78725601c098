//! A credential source that asks the cluster itself for service account tokens
//!
//! The source is created from a [`Connection`] and may then be attached, as a
//! provider, to that very same connection. Issuing a token requires an
//! authenticated call, and that call must not be authenticated by the provider
//! that is in the middle of computing its own token. The source therefore
//! captures a [`BootstrapSnapshot`] of the connection's authentication when it
//! is constructed and performs every issuance call with that identity.

use async_trait::async_trait;
use kube_clock::{Clock, DurationSecs, InvalidTimestamp, System, UnixTime};
use kube_tokens::{
    sources::CredentialSource, Audience, CachedTokenProvider, Credential, NamespaceName,
    ServiceAccountName,
};
use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;

use crate::{BootstrapSnapshot, CallError, Connection, WeakConnection};

pub mod dto;

/// The token lifetime requested when none is configured
pub const DEFAULT_EXPIRATION: DurationSecs = DurationSecs(3600);

/// A credential source issuing tokens for a service account
#[derive(Debug)]
pub struct ServiceAccountTokenSource<C = System> {
    connection: WeakConnection,
    bootstrap: BootstrapSnapshot,
    namespace: NamespaceName,
    service_account: ServiceAccountName,
    expiration: DurationSecs,
    audiences: Vec<Audience>,
    clock: C,
}

impl ServiceAccountTokenSource<System> {
    /// Constructs a new source issuing tokens for `service_account` in `namespace`
    ///
    /// Both names are validated resource names, so neither can reshape the
    /// path of the issuance endpoint.
    ///
    /// The connection's current authentication is captured right away and is
    /// what every later issuance call authenticates with. The source only holds
    /// a weak handle to the connection, so the caller must keep the connection
    /// alive for as long as tokens are needed.
    pub fn new(
        connection: &Connection,
        namespace: impl Into<NamespaceName>,
        service_account: impl Into<ServiceAccountName>,
    ) -> Self {
        Self {
            connection: connection.downgrade(),
            bootstrap: BootstrapSnapshot::capture(connection),
            namespace: namespace.into(),
            service_account: service_account.into(),
            expiration: DEFAULT_EXPIRATION,
            audiences: Vec::new(),
            clock: System,
        }
    }
}

impl<C> ServiceAccountTokenSource<C> {
    /// Sets the requested lifetime of issued tokens
    ///
    /// This does not change when the provider considers a token stale; that
    /// follows the expiry the server reports.
    pub fn with_expiration_seconds(mut self, seconds: u64) -> Self {
        self.expiration = DurationSecs(seconds);
        self
    }

    /// Sets the intended audiences of issued tokens
    pub fn with_audiences<I, A>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Audience>,
    {
        self.audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ServiceAccountTokenSource<D> {
        ServiceAccountTokenSource {
            connection: self.connection,
            bootstrap: self.bootstrap,
            namespace: self.namespace,
            service_account: self.service_account,
            expiration: self.expiration,
            audiences: self.audiences,
            clock,
        }
    }

    /// Wraps this source in a caching provider with the default refresh buffer
    pub fn into_provider(self) -> CachedTokenProvider<Self> {
        CachedTokenProvider::new(self)
    }

    /// The namespace of the service account
    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    /// The name of the service account
    pub fn service_account(&self) -> &ServiceAccountName {
        &self.service_account
    }

    /// The requested token lifetime
    pub fn expiration(&self) -> DurationSecs {
        self.expiration
    }

    /// The intended audiences of issued tokens
    pub fn audiences(&self) -> &[Audience] {
        &self.audiences
    }

    /// The identity that issuance calls authenticate with
    pub fn bootstrap(&self) -> &BootstrapSnapshot {
        &self.bootstrap
    }

    /// The path of the token issuance endpoint
    pub fn path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/serviceaccounts/{}/token",
            self.namespace, self.service_account
        )
    }

    /// The request sent to the issuance endpoint
    pub fn token_request(&self) -> dto::TokenRequest {
        dto::TokenRequest {
            api_version: dto::API_VERSION.to_owned(),
            kind: dto::KIND.to_owned(),
            spec: dto::TokenRequestSpec {
                expiration_seconds: self.expiration.0,
                audiences: self.audiences.clone(),
            },
        }
    }
}

/// An error while requesting a token from the issuance endpoint
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The connection the source was created from no longer exists
    #[error("bootstrap connection is no longer available")]
    ConnectionDropped,
    /// Unable to serialize the token request
    #[error("error serializing token request")]
    RequestBody(#[source] serde_json::Error),
    /// The issuance call failed
    #[error("error calling token issuance endpoint")]
    Call(#[from] CallError),
    /// Unable to deserialize the issuance response
    #[error("error deserializing token issuance response")]
    ResponseBody(#[source] serde_json::Error),
    /// The issuance response did not contain a token
    #[error("issuance response missing token")]
    MissingToken,
    /// The issuance response reported an unreadable expiry
    #[error("issuance response has an invalid expiration timestamp")]
    InvalidExpiration(#[source] InvalidTimestamp),
}

#[async_trait]
impl<C: Clock + Send + Sync> CredentialSource for ServiceAccountTokenSource<C> {
    type Error = TokenRequestError;

    #[tracing::instrument(
        err,
        skip(self),
        fields(
            namespace = %self.namespace,
            service_account = %self.service_account,
            expiration_seconds = self.expiration.0,
            audiences = self.audiences.len(),
        ),
    )]
    async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(TokenRequestError::ConnectionDropped)?;

        let body =
            serde_json::to_vec(&self.token_request()).map_err(TokenRequestError::RequestBody)?;

        tracing::trace!("requesting service account token");

        let response = self
            .bootstrap
            .call(&connection, Method::POST, &self.path(), Some(body.into()))
            .await?;

        let response: dto::TokenRequestResponse =
            serde_json::from_slice(&response).map_err(TokenRequestError::ResponseBody)?;
        let status = response.status.ok_or(TokenRequestError::MissingToken)?;
        let token = status.token.ok_or(TokenRequestError::MissingToken)?;

        let expires_at = match status.expiration_timestamp.as_deref() {
            Some(timestamp) => {
                UnixTime::parse_rfc3339(timestamp).map_err(TokenRequestError::InvalidExpiration)?
            }
            None => {
                // Not confirmed by the server, only what was asked for
                let estimate = self.clock.now() + self.expiration;
                tracing::debug!(
                    expires_at = estimate.0,
                    "issuance response has no expiration timestamp, estimating from requested lifetime"
                );
                estimate
            }
        };

        tracing::info!(expires_at = expires_at.0, "received service account token");

        Ok(Credential::expiring_at(token, expires_at))
    }
}

/// Recognized options for a service account token provider
///
/// Keys are camel-cased, matching the rest of the cluster API:
///
/// ```
/// # use kube_client::ServiceAccountTokenOptions;
/// let options: ServiceAccountTokenOptions = serde_json::from_str(
///     r#"{ "expirationSeconds": 600, "audiences": ["vault"], "refreshBuffer": 30 }"#,
/// ).unwrap();
/// assert_eq!(options.expiration_seconds, 600);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccountTokenOptions {
    /// The requested token lifetime in seconds
    pub expiration_seconds: u64,
    /// The intended audiences; empty means the server's default audience
    pub audiences: Vec<Audience>,
    /// How long before expiry a token is renewed
    pub refresh_buffer: DurationSecs,
}

impl Default for ServiceAccountTokenOptions {
    /// Requests one-hour tokens for the default audience, renewed a minute early
    fn default() -> Self {
        Self {
            expiration_seconds: DEFAULT_EXPIRATION.0,
            audiences: Vec::new(),
            refresh_buffer: kube_tokens::DEFAULT_REFRESH_BUFFER,
        }
    }
}

impl ServiceAccountTokenOptions {
    /// Builds a provider issuing tokens for `service_account` in `namespace`
    pub fn provider(
        &self,
        connection: &Connection,
        namespace: impl Into<NamespaceName>,
        service_account: impl Into<ServiceAccountName>,
    ) -> CachedTokenProvider<ServiceAccountTokenSource> {
        ServiceAccountTokenSource::new(connection, namespace, service_account)
            .with_expiration_seconds(self.expiration_seconds)
            .with_audiences(self.audiences.iter().cloned())
            .into_provider()
            .with_refresh_buffer(self.refresh_buffer)
    }
}
