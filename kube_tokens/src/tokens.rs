use kube_clock::{DurationSecs, UnixTime};

use crate::{AccessToken, AccessTokenRef};

/// A bearer token together with the instant it stops being valid
///
/// A credential without an expiry never goes stale on its own; only an
/// explicit replacement gets rid of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    token: AccessToken,
    expires_at: Option<UnixTime>,
}

impl Credential {
    /// Constructs a credential from a token and an optional expiry
    pub fn new(token: impl Into<AccessToken>, expires_at: Option<UnixTime>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Constructs a credential that never expires
    #[inline]
    pub fn non_expiring(token: impl Into<AccessToken>) -> Self {
        Self::new(token, None)
    }

    /// Constructs a credential that expires at the given time
    #[inline]
    pub fn expiring_at(token: impl Into<AccessToken>, expires_at: UnixTime) -> Self {
        Self::new(token, Some(expires_at))
    }

    /// Gets the bearer token
    #[inline]
    pub fn token(&self) -> &AccessTokenRef {
        &self.token
    }

    /// Gets the time at which the token expires, if it expires at all
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Whether this credential must be replaced before use as of `now`
    ///
    /// The credential counts as expired from `refresh_buffer` before its literal
    /// expiry onwards, inclusive of that instant.
    #[inline]
    pub fn is_expired_at(&self, now: UnixTime, refresh_buffer: DurationSecs) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at - refresh_buffer,
            None => false,
        }
    }
}
