//! Credential sources
//!
//! A source knows how to obtain a brand new [`Credential`]. It does not cache
//! anything; wrap it in a [`CachedTokenProvider`](crate::CachedTokenProvider)
//! to get the caching and expiry policy shared by all strategies.

use crate::{AccessToken, Credential};
use async_trait::async_trait;
use std::{convert::Infallible, error};

#[cfg(feature = "exec")]
pub mod exec;

#[cfg(feature = "exec")]
pub use exec::ExecCredentialSource;

/// An asynchronous source for credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The error type returned in the event that obtaining a credential fails
    type Error: error::Error + Send + Sync + 'static;

    /// Obtains a fresh credential
    ///
    /// On success both the token and the expiry are replaced. Returning a
    /// credential without an expiry marks it as never expiring.
    async fn request_credential(&mut self) -> Result<Credential, Self::Error>;
}

/// A source which always provides the same non-expiring token
#[derive(Debug)]
pub struct ConstTokenSource {
    token: AccessToken,
}

impl ConstTokenSource {
    /// Constructs a new source for the given token
    pub fn new(token: impl Into<AccessToken>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for ConstTokenSource {
    type Error = Infallible;

    async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
        Ok(Credential::non_expiring(self.token.clone()))
    }
}
