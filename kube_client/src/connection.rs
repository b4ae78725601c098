//! A connection to the cluster API

use std::{
    fmt,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use kube_tokens::{
    AccessToken, AuthenticationError, CachedTokenProvider, NamespaceName, ServiceAccountName,
    TokenProvider,
};
use reqwest::{header, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use thiserror::Error;
use url::Url;

use crate::{
    authenticator::{AuthSlot, AuthSourceMiddleware, Substituted},
    AuthSource, ServiceAccountTokenSource,
};

/// A handle to the cluster API
///
/// Cloning the handle is cheap; clones share the same authentication slot.
/// The slot holds a fixed token, an attached [`TokenProvider`], or nothing,
/// and is consulted for every call.
///
/// While [`call_with_auth`](Self::call_with_auth) is in flight, the slot holds
/// the substituted source and [`auth_source`](Self::auth_source) reports it.
/// Only that one request authenticates with it. Calls made at the same time
/// from clones of the handle keep using the connection's own authentication,
/// which for an attached provider means waiting for a refresh in progress.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    client: ClientWithMiddleware,
    base_url: Url,
    auth: Arc<AuthSlot>,
}

/// A non-owning handle to a [`Connection`]
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

/// An error while calling the cluster API
#[derive(Debug, Error)]
pub enum CallError {
    /// The path could not be joined onto the base URL
    #[error("invalid request path {path:?}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// The underlying parse error
        source: url::ParseError,
    },
    /// No token could be obtained for the request
    #[error("unable to authenticate request")]
    Authentication(#[source] AuthenticationError),
    /// Unable to send the request
    #[error("error sending request to cluster")]
    RequestSend(#[source] reqwest_middleware::Error),
    /// The cluster answered with an error status
    #[error("error response from cluster ({status}): {body}")]
    ErrorWithBody {
        /// The response status
        status: StatusCode,
        /// The body of the error
        body: String,
        /// The underlying request error
        source: reqwest::Error,
    },
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
}

impl CallError {
    /// The response status, if the cluster answered at all
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ErrorWithBody { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_send(error: reqwest_middleware::Error) -> Self {
        match error {
            reqwest_middleware::Error::Middleware(error) => {
                match error.downcast::<AuthenticationError>() {
                    Ok(error) => Self::Authentication(error),
                    Err(error) => Self::RequestSend(reqwest_middleware::Error::Middleware(error)),
                }
            }
            error => Self::RequestSend(error),
        }
    }
}

impl Connection {
    /// Constructs an anonymous connection to the cluster at `base_url`
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Constructs an anonymous connection using a preconfigured HTTP client
    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        let auth = Arc::new(AuthSlot::default());
        let client = ClientBuilder::new(client)
            .with(AuthSourceMiddleware::new(auth.clone()))
            .build();

        Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                auth,
            }),
        }
    }

    /// Authenticates subsequent calls with a fixed token
    pub fn with_token(self, token: impl Into<AccessToken>) -> Self {
        self.set_token(token);
        self
    }

    /// Authenticates subsequent calls with a token issued for a service account
    ///
    /// The token is requested from this very cluster, authenticated with
    /// whatever credential the connection holds at this moment.
    pub fn with_service_account_token(
        self,
        namespace: impl Into<NamespaceName>,
        service_account: impl Into<ServiceAccountName>,
        expiration_seconds: u64,
    ) -> Self {
        let provider = ServiceAccountTokenSource::new(&self, namespace, service_account)
            .with_expiration_seconds(expiration_seconds)
            .into_provider();
        self.attach(Arc::new(provider));
        self
    }

    /// The base URL that request paths are resolved against
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Replaces the connection's authentication with a fixed token
    pub fn set_token(&self, token: impl Into<AccessToken>) {
        self.inner.auth.replace(AuthSource::Token(token.into()));
    }

    /// Replaces the connection's authentication with a token provider
    pub fn attach(&self, provider: Arc<dyn TokenProvider>) {
        self.inner.auth.replace(AuthSource::Provider(provider));
    }

    /// Attaches a provider built around a credential source
    pub fn attach_source<S>(&self, source: S)
    where
        CachedTokenProvider<S>: TokenProvider + 'static,
    {
        self.attach(Arc::new(CachedTokenProvider::new(source)));
    }

    /// Removes an attached provider, leaving the connection anonymous
    ///
    /// Returns the provider that was attached, if any. A fixed token is
    /// left in place.
    pub fn detach(&self) -> Option<Arc<dyn TokenProvider>> {
        self.inner.auth.take_provider()
    }

    /// A snapshot of the connection's current authentication
    pub fn auth_source(&self) -> AuthSource {
        self.inner.auth.get()
    }

    /// The token the next call would carry
    ///
    /// With a provider attached this may perform a refresh.
    pub async fn auth_token(&self) -> Result<Option<AccessToken>, AuthenticationError> {
        self.inner.auth.own().resolve().await
    }

    /// Gets a non-owning handle to this connection
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Calls the cluster API, returning the response body
    ///
    /// The connection's current credential is attached as a bearer token. A
    /// non-success status is returned as an error carrying the response body.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, CallError> {
        self.execute(method, path, body, false).await
    }

    #[tracing::instrument(
        level = "debug",
        err,
        skip_all,
        fields(method = %method, path = %path, substituted = substituted)
    )]
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        substituted: bool,
    ) -> Result<Bytes, CallError> {
        let url = self.url_for(path)?;

        let mut req = self
            .inner
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if substituted {
            req = req.with_extension(Substituted);
        }
        if let Some(body) = body {
            req = req
                .header(header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let resp = req.send().await.map_err(CallError::from_send)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from cluster"
        );

        if let Err(source) = resp.error_for_status_ref() {
            let status = resp.status();
            let body = resp.text().await.map_err(CallError::BodyReadError)?;
            return Err(CallError::ErrorWithBody {
                status,
                body,
                source,
            });
        }

        resp.bytes().await.map_err(CallError::BodyReadError)
    }

    /// Calls the cluster API with `source` standing in for the connection's authentication
    ///
    /// A provider given as `source` is asked for its token before anything is
    /// swapped. The connection's authentication is then replaced for exactly
    /// this one call and put back afterwards on every exit path, including
    /// errors and the returned future being dropped. Other substitutions on the
    /// same connection wait for this one to finish, and ordinary calls made
    /// meanwhile are not affected by it.
    pub async fn call_with_auth(
        &self,
        source: AuthSource,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, CallError> {
        let source = source.pin().await.map_err(CallError::Authentication)?;
        let _substitution = self.inner.auth.substitute(source).await;
        self.execute(method, path, body, true).await
    }

    fn url_for(&self, path: &str) -> Result<Url, CallError> {
        let base = self.inner.base_url.as_str().trim_end_matches('/');
        let joined = if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        };

        Url::parse(&joined).map_err(|source| CallError::InvalidPath {
            path: path.to_owned(),
            source,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("base_url", &self.inner.base_url.as_str())
            .field("auth", &self.inner.auth.get())
            .finish()
    }
}

impl WeakConnection {
    /// Gets the connection back, if it is still alive
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
