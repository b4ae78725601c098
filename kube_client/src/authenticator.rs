//! Attaching the connection's current credential to outgoing requests

use std::{
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{BufMut, BytesMut};
use kube_tokens::{AccessToken, AuthenticationError, TokenProvider};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

/// Where a connection gets the bearer token for its requests
#[derive(Clone, Default)]
pub enum AuthSource {
    /// Requests are sent without credentials
    #[default]
    Anonymous,
    /// Requests carry a fixed token
    Token(AccessToken),
    /// Requests carry whatever token the provider currently hands out
    Provider(Arc<dyn TokenProvider>),
}

impl AuthSource {
    /// Resolves the token that a request would carry right now
    ///
    /// For a provider this may perform a refresh.
    pub async fn resolve(&self) -> std::result::Result<Option<AccessToken>, AuthenticationError> {
        match self {
            Self::Anonymous => Ok(None),
            Self::Token(token) => Ok(Some(token.clone())),
            Self::Provider(provider) => provider.token().await.map(Some),
        }
    }

    /// Replaces a provider by the token it currently hands out
    ///
    /// The result never needs a provider to be consulted again.
    pub(crate) async fn pin(self) -> std::result::Result<Self, AuthenticationError> {
        match self {
            Self::Provider(provider) => provider.token().await.map(Self::Token),
            other => Ok(other),
        }
    }
}

impl fmt::Debug for AuthSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Token(token) => f.debug_tuple("Token").field(token).finish(),
            Self::Provider(provider) => f.debug_tuple("Provider").field(provider).finish(),
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    current: AuthSource,
    /// The connection's own source while a substitution is active
    shadowed: Option<AuthSource>,
}

impl SlotState {
    fn own(&self) -> &AuthSource {
        self.shadowed.as_ref().unwrap_or(&self.current)
    }

    fn own_mut(&mut self) -> &mut AuthSource {
        match &mut self.shadowed {
            Some(own) => own,
            None => &mut self.current,
        }
    }
}

/// The authentication slot of a connection
#[derive(Debug, Default)]
pub(crate) struct AuthSlot {
    state: Mutex<SlotState>,
    exclusive: tokio::sync::Mutex<()>,
}

/// Marks the one request that authenticates with a substituted source
#[derive(Clone, Copy, Debug)]
pub(crate) struct Substituted;

impl AuthSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What the slot holds right now, including a substituted source
    pub(crate) fn get(&self) -> AuthSource {
        self.state().current.clone()
    }

    /// The connection's own source, ignoring any substitution in progress
    pub(crate) fn own(&self) -> AuthSource {
        let state = self.state();
        if state.shadowed.is_some() {
            tracing::debug!(
                "connection authentication is substituted for another call, using its own"
            );
        }
        state.own().clone()
    }

    /// Replaces the connection's own source
    ///
    /// During a substitution the replacement takes effect once the
    /// substitution ends.
    pub(crate) fn replace(&self, source: AuthSource) -> AuthSource {
        mem::replace(self.state().own_mut(), source)
    }

    pub(crate) fn take_provider(&self) -> Option<Arc<dyn TokenProvider>> {
        let mut state = self.state();
        let own = state.own_mut();
        if !matches!(*own, AuthSource::Provider(_)) {
            return None;
        }

        match mem::take(own) {
            AuthSource::Provider(provider) => Some(provider),
            _ => None,
        }
    }

    /// Installs `source` until the returned guard is dropped
    ///
    /// Substitutions on the same slot are serialized. The connection's own
    /// source, including any replacement made in the meantime, is put back
    /// when the guard drops, however the holder exits.
    pub(crate) async fn substitute(&self, source: AuthSource) -> AuthSubstitution<'_> {
        let exclusive = self.exclusive.lock().await;

        {
            let mut state = self.state();
            let own = mem::replace(&mut state.current, source);
            tracing::trace!(prior = ?own, "substituted connection authentication");
            state.shadowed = Some(own);
        }

        AuthSubstitution {
            slot: self,
            _exclusive: exclusive,
        }
    }
}

/// A temporary replacement of a connection's authentication
pub(crate) struct AuthSubstitution<'a> {
    slot: &'a AuthSlot,
    _exclusive: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for AuthSubstitution<'_> {
    fn drop(&mut self) {
        let mut state = self.slot.state();
        if let Some(own) = state.shadowed.take() {
            state.current = own;
            tracing::trace!("restored connection authentication");
        }
    }
}

impl fmt::Debug for AuthSubstitution<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthSubstitution")
            .field("own", &self.slot.state().shadowed)
            .finish()
    }
}

/// A middleware that injects the connection's current token into outgoing requests
///
/// If a request already has an `Authorization` header, it is left in place.
#[derive(Clone, Debug)]
pub(crate) struct AuthSourceMiddleware {
    slot: Arc<AuthSlot>,
}

impl AuthSourceMiddleware {
    pub(crate) fn new(slot: Arc<AuthSlot>) -> Self {
        Self { slot }
    }
}

fn bearer_header(token: &AccessToken) -> std::result::Result<header::HeaderValue, AuthenticationError> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze()).map_err(|e| {
        AuthenticationError::with_source("token is not a valid header value", e)
    })?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl Middleware for AuthSourceMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !req.headers().contains_key(header::AUTHORIZATION) {
            let source = if extensions.get::<Substituted>().is_some() {
                self.slot.get()
            } else {
                self.slot.own()
            };
            let token = source
                .resolve()
                .await
                .map_err(reqwest_middleware::Error::middleware)?;

            if let Some(token) = token {
                tracing::trace!(source = ?source, "attaching bearer token");
                let value = bearer_header(&token).map_err(reqwest_middleware::Error::middleware)?;
                req.headers_mut().insert(header::AUTHORIZATION, value);
            }
        }

        next.run(req, extensions).await
    }
}
