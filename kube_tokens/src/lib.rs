//! Cached, lazily refreshed bearer credentials
//!
//! Every outbound call a cluster client makes needs a bearer token. This crate
//! supplies those tokens behind a single contract, [`TokenProvider`], no matter
//! how they are minted: a fixed token, an external credential plugin, or a
//! token issued by the cluster API itself.
//!
//! The split is the following:
//!
//! * A [`CredentialSource`][sources::CredentialSource] knows how to obtain a new
//!   [`Credential`], a token plus an optional expiry. It caches nothing.
//! * A [`CachedTokenProvider`] wraps a source and decides when the cached
//!   credential is stale. A credential counts as expired a _refresh buffer_
//!   (60 seconds by default) ahead of its literal expiry, so that renewal
//!   happens slightly early rather than racing the deadline. Credentials
//!   without an expiry never go stale.
//!
//! Refreshes are driven by callers: the first call to
//! [`token()`][TokenProvider::token] after the credential went stale performs
//! the refresh and every caller waiting behind it reuses the result. There is
//! no background task.
//!
//! ```
//! use kube_clock::DurationSecs;
//! use kube_tokens::{sources::ConstTokenSource, CachedTokenProvider, TokenProvider};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let provider = CachedTokenProvider::new(ConstTokenSource::new("static-token"))
//!     .with_refresh_buffer(DurationSecs(120));
//!
//! let token = provider.token().await.unwrap();
//! assert_eq!(token.as_str(), "static-token");
//! # }
//! ```
//!
//! # Features
//!
//! * `exec` (default): Provides [`ExecCredentialSource`][sources::ExecCredentialSource],
//!   which obtains credentials by running an external credential plugin.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod error;
mod provider;
pub mod sources;
mod tokens;

pub use braids::*;
pub use error::AuthenticationError;
pub use provider::{CachedTokenProvider, TokenProvider, DEFAULT_REFRESH_BUFFER};
pub use tokens::Credential;
