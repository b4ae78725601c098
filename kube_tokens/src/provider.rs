//! The caching contract shared by every credential strategy

use std::{
    error, fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use async_trait::async_trait;
use kube_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::sync::Mutex;

use crate::{sources::CredentialSource, AccessToken, AuthenticationError, Credential};

/// The default margin by which credentials are renewed ahead of their expiry
pub const DEFAULT_REFRESH_BUFFER: DurationSecs = DurationSecs(60);

/// A provider of bearer tokens for outbound calls
///
/// A provider holds at most one credential. It hands out the cached token while
/// that credential is fresh and obtains a new one, on the caller's time, once it
/// is not. Nothing is refreshed in the background.
#[async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    /// Gets a current token, refreshing first if there is no fresh credential
    async fn token(&self) -> Result<AccessToken, AuthenticationError>;

    /// Unconditionally obtains a new credential
    ///
    /// On failure the previously cached credential, if any, is kept.
    async fn refresh(&self) -> Result<(), AuthenticationError>;

    /// Whether the cached credential is missing or due for renewal
    fn is_expired(&self) -> bool;

    /// The expiry of the cached credential
    fn expires_at(&self) -> Option<UnixTime>;

    /// The margin by which credentials are renewed ahead of their expiry
    fn refresh_buffer(&self) -> DurationSecs;

    /// Changes the renewal margin
    ///
    /// Applies from the next expiry check onwards, including against the
    /// credential already cached.
    fn set_refresh_buffer(&self, refresh_buffer: DurationSecs);
}

/// A token provider that caches the credentials of a [`CredentialSource`]
pub struct CachedTokenProvider<S, C = System> {
    source: Mutex<S>,
    credential: RwLock<Option<Credential>>,
    refresh_buffer: AtomicU64,
    clock: C,
}

impl<S> CachedTokenProvider<S, System> {
    /// Constructs a new provider around `source`, initially holding no credential
    pub fn new(source: S) -> Self {
        Self {
            source: Mutex::new(source),
            credential: RwLock::new(None),
            refresh_buffer: AtomicU64::new(DEFAULT_REFRESH_BUFFER.0),
            clock: System,
        }
    }
}

impl<S, C> CachedTokenProvider<S, C> {
    /// Sets the margin by which credentials are renewed ahead of their expiry
    pub fn with_refresh_buffer(self, refresh_buffer: DurationSecs) -> Self {
        self.refresh_buffer
            .store(refresh_buffer.0, Ordering::Release);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> CachedTokenProvider<S, D> {
        CachedTokenProvider {
            source: self.source,
            credential: self.credential,
            refresh_buffer: self.refresh_buffer,
            clock,
        }
    }

    /// A copy of the currently cached credential
    pub fn credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn buffer(&self) -> DurationSecs {
        DurationSecs(self.refresh_buffer.load(Ordering::Acquire))
    }

    fn store(&self, credential: Credential) {
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }
}

impl<S, C: Clock> CachedTokenProvider<S, C> {
    fn fresh_token(&self) -> Option<AccessToken> {
        let now = self.clock.now();
        let buffer = self.buffer();
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| !c.is_expired_at(now, buffer))
            .map(|c| c.token().to_owned())
    }
}

impl<S: CredentialSource, C: Clock> CachedTokenProvider<S, C> {
    /// Requests a credential from the source and caches it
    ///
    /// The caller must hold the source lock, which makes the check for an
    /// expired credential and its replacement a single step for other callers.
    async fn refresh_locked(&self, source: &mut S) -> Result<Credential, AuthenticationError> {
        tracing::debug!("requesting new credential");

        match source.request_credential().await {
            Ok(credential) => {
                tracing::info!(
                    expires_at = credential.expires_at().map(|t| t.0),
                    "obtained new credential"
                );
                self.store(credential.clone());
                Ok(credential)
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to obtain credential, keeping previously cached credential"
                );
                Err(AuthenticationError::with_source(
                    "unable to obtain credential",
                    error,
                ))
            }
        }
    }
}

impl<S, C> fmt::Debug for CachedTokenProvider<S, C>
where
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CachedTokenProvider")
            .field("source", &self.source)
            .field("credential", &self.credential())
            .field("refresh_buffer", &self.buffer())
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl<S, C> TokenProvider for CachedTokenProvider<S, C>
where
    S: CredentialSource + fmt::Debug,
    C: Clock + Send + Sync + fmt::Debug,
{
    async fn token(&self) -> Result<AccessToken, AuthenticationError> {
        if let Some(token) = self.fresh_token() {
            tracing::trace!("using cached credential");
            return Ok(token);
        }

        let mut source = self.source.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(token) = self.fresh_token() {
            tracing::trace!("credential was refreshed by another caller");
            return Ok(token);
        }

        let credential = self.refresh_locked(&mut source).await?;
        Ok(credential.token().to_owned())
    }

    async fn refresh(&self) -> Result<(), AuthenticationError> {
        let mut source = self.source.lock().await;
        self.refresh_locked(&mut source).await.map(|_| ())
    }

    fn is_expired(&self) -> bool {
        let now = self.clock.now();
        let buffer = self.buffer();
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |c| c.is_expired_at(now, buffer))
    }

    fn expires_at(&self) -> Option<UnixTime> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Credential::expires_at)
    }

    fn refresh_buffer(&self) -> DurationSecs {
        self.buffer()
    }

    fn set_refresh_buffer(&self, refresh_buffer: DurationSecs) {
        self.refresh_buffer
            .store(refresh_buffer.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error as _,
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use kube_clock::TestClock;

    use super::*;
    use crate::sources::ConstTokenSource;

    const START: UnixTime = UnixTime(1_700_000_000);

    /// Issues `token-N` credentials valid for `lifetime` from the clock's now
    #[derive(Debug)]
    struct CountingSource {
        clock: TestClock,
        lifetime: Option<i64>,
        count: Arc<AtomicUsize>,
    }

    impl CountingSource {
        fn new(clock: &TestClock, lifetime: Option<i64>) -> (Self, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            let source = Self {
                clock: clock.clone(),
                lifetime,
                count: count.clone(),
            };
            (source, count)
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        type Error = io::Error;

        async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;

            let now = self.clock.now().0 as i64;
            let expires_at = self.lifetime.map(|l| UnixTime((now + l) as u64));
            Ok(Credential::new(format!("token-{}", n), expires_at))
        }
    }

    /// Succeeds once, then fails every time after
    #[derive(Debug)]
    struct FlakySource {
        calls: usize,
        expires_at: UnixTime,
    }

    #[async_trait]
    impl CredentialSource for FlakySource {
        type Error = io::Error;

        async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
            self.calls += 1;
            if self.calls == 1 {
                Ok(Credential::expiring_at("first", self.expires_at))
            } else {
                Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "issuer unavailable",
                ))
            }
        }
    }

    fn provider(
        lifetime: Option<i64>,
    ) -> (
        CachedTokenProvider<CountingSource, TestClock>,
        TestClock,
        Arc<AtomicUsize>,
    ) {
        let clock = TestClock::new(START);
        let (source, count) = CountingSource::new(&clock, lifetime);
        let provider = CachedTokenProvider::new(source).with_clock(clock.clone());
        (provider, clock, count)
    }

    mod when_no_credential_has_been_obtained {
        use super::*;

        #[test]
        fn provider_is_expired() {
            let (provider, _, _) = provider(Some(3600));
            assert!(provider.is_expired());
            assert_eq!(provider.expires_at(), None);
        }

        #[tokio::test]
        async fn first_token_request_refreshes_once() {
            let (provider, _, count) = provider(Some(3600));

            let token = provider.token().await.unwrap();

            assert_eq!(token.as_str(), "token-1");
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(provider.expires_at(), Some(START + DurationSecs(3600)));
        }
    }

    mod when_credential_never_expires {
        use super::*;

        #[tokio::test]
        async fn provider_is_never_expired() {
            let (provider, clock, count) = provider(None);
            provider.refresh().await.unwrap();

            clock.set(UnixTime(u64::MAX));

            assert!(!provider.is_expired());
            assert_eq!(provider.token().await.unwrap().as_str(), "token-1");
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn const_source_is_cached_forever() {
            let provider = CachedTokenProvider::new(ConstTokenSource::new("static"));

            assert_eq!(provider.token().await.unwrap().as_str(), "static");
            assert!(!provider.is_expired());
            assert_eq!(provider.expires_at(), None);
        }
    }

    mod when_credential_is_fresh {
        use super::*;

        #[tokio::test]
        async fn repeated_requests_do_not_refresh() {
            let (provider, _, count) = provider(Some(3600));

            let first = provider.token().await.unwrap();
            let second = provider.token().await.unwrap();

            assert_eq!(first, second);
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn credential_is_fresh_until_buffer_boundary() {
            let (provider, clock, _) = provider(Some(3600));
            provider.refresh().await.unwrap();

            clock.set(START + DurationSecs(3539));
            assert!(!provider.is_expired());

            clock.set(START + DurationSecs(3540));
            assert!(provider.is_expired());
        }
    }

    mod when_credential_is_expired {
        use super::*;

        #[tokio::test]
        async fn past_expiry_is_expired_and_refreshes_once() {
            let (provider, _, count) = provider(Some(-3600));
            provider.refresh().await.unwrap();
            assert!(provider.is_expired());
            assert_eq!(count.load(Ordering::SeqCst), 1);

            provider.token().await.unwrap();

            assert_eq!(count.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn credential_within_buffer_is_expired() {
            let (provider, _, _) = provider(Some(30));
            provider.refresh().await.unwrap();
            assert!(provider.is_expired());
        }

        #[tokio::test]
        async fn stale_token_is_replaced_and_then_reused() {
            let (provider, clock, count) = provider(Some(3600));
            assert_eq!(provider.token().await.unwrap().as_str(), "token-1");

            clock.advance(DurationSecs(3600));

            let first = provider.token().await.unwrap();
            let second = provider.token().await.unwrap();

            assert_eq!(first.as_str(), "token-2");
            assert_eq!(first, second);
            assert_eq!(count.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn concurrent_callers_share_one_refresh() {
            let (provider, _, count) = provider(Some(3600));

            let (a, b) = tokio::join!(provider.token(), provider.token());

            assert_eq!(a.unwrap(), b.unwrap());
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    mod when_refresh_buffer_changes {
        use super::*;

        #[tokio::test]
        async fn staleness_is_reevaluated_against_same_expiry() {
            let (provider, _, _) = provider(Some(90));
            provider.refresh().await.unwrap();
            let expires_at = provider.expires_at();

            assert_eq!(provider.refresh_buffer(), DEFAULT_REFRESH_BUFFER);
            assert!(!provider.is_expired());

            provider.set_refresh_buffer(DurationSecs(120));

            assert!(provider.is_expired());
            assert_eq!(provider.expires_at(), expires_at);
        }

        #[tokio::test]
        async fn builder_buffer_applies_from_the_start() {
            let clock = TestClock::new(START);
            let (source, _) = CountingSource::new(&clock, Some(90));
            let provider = CachedTokenProvider::new(source)
                .with_refresh_buffer(DurationSecs(120))
                .with_clock(clock);

            provider.refresh().await.unwrap();

            assert!(provider.is_expired());
        }
    }

    mod when_refresh_fails {
        use super::*;

        #[tokio::test]
        async fn error_is_wrapped_with_original_cause() {
            let provider = CachedTokenProvider::new(FlakySource {
                calls: 1,
                expires_at: UnixTime(u64::MAX),
            });

            let error = provider.token().await.unwrap_err();

            let cause = error
                .source()
                .and_then(|s| s.downcast_ref::<io::Error>())
                .expect("original cause should be kept");
            assert_eq!(cause.kind(), io::ErrorKind::ConnectionRefused);
            assert_eq!(provider.credential(), None);
        }

        #[tokio::test]
        async fn cached_credential_is_left_untouched() {
            let clock = TestClock::new(START);
            let provider = CachedTokenProvider::new(FlakySource {
                calls: 0,
                expires_at: START + DurationSecs(600),
            })
            .with_clock(clock.clone());

            provider.token().await.unwrap();
            let before = provider.credential();

            assert!(provider.refresh().await.is_err());

            assert_eq!(provider.credential(), before);
            assert_eq!(provider.token().await.unwrap().as_str(), "first");
        }

        #[tokio::test]
        async fn token_is_retried_on_next_request() {
            let clock = TestClock::new(START);
            let provider = CachedTokenProvider::new(FlakySource {
                calls: 0,
                expires_at: START + DurationSecs(600),
            })
            .with_clock(clock.clone());

            provider.token().await.unwrap();
            clock.advance(DurationSecs(600));

            assert!(provider.token().await.is_err());
            assert!(provider.token().await.is_err());
            assert_eq!(
                provider.credential().map(|c| c.token().as_str().to_owned()),
                Some("first".to_owned())
            );
        }
    }
}
