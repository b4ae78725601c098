//! A cluster API connection with pluggable token providers
//!
//! A [`Connection`] attaches a bearer token to every call it makes. That token
//! comes from the connection's authentication slot, which holds either a fixed
//! token or an attached [`TokenProvider`](kube_tokens::TokenProvider). With a
//! provider attached, each call asks the provider for a current token, which
//! refreshes its credential when it has gone stale.
//!
//! Providers may themselves need the cluster to mint their credentials. The
//! [`ServiceAccountTokenSource`] requests short-lived tokens for a service
//! account from the cluster's token issuance endpoint, and can be attached to
//! the same connection it requests them from:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kube_client::{Connection, ServiceAccountTokenSource};
//! use kube_tokens::{NamespaceName, ServiceAccountName};
//! use reqwest::Method;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::new("https://cluster.example:6443".parse()?)
//!     .with_token("long-lived-admin-token");
//!
//! let namespace = NamespaceName::new("default".to_owned())?;
//! let service_account = ServiceAccountName::new("deployer".to_owned())?;
//! let provider = ServiceAccountTokenSource::new(&connection, namespace, service_account)
//!     .with_expiration_seconds(600)
//!     .with_audiences(["https://kubernetes.default.svc"])
//!     .into_provider();
//!
//! connection.attach(Arc::new(provider));
//!
//! // Authenticated as `deployer`; the token itself was requested with the
//! // admin token the connection held before the provider was attached.
//! let pods = connection
//!     .call(Method::GET, "/api/v1/namespaces/default/pods", None)
//!     .await?;
//! # let _ = pods;
//! # Ok(())
//! # }
//! ```
//!
//! The identity used to request tokens is captured when the source is
//! constructed, as a [`BootstrapSnapshot`]. During the issuance call the
//! connection's slot is swapped to that identity and swapped back once the
//! call finishes, whether it succeeds, fails, or is abandoned. The provider
//! being refreshed is therefore never asked for its own token.
//!
//! The swap is scoped to one request. Other calls made on the same connection
//! at the same moment still authenticate with the connection's own source, so
//! they wait for the refresh instead of borrowing the bootstrap identity.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod authenticator;
mod bootstrap;
mod connection;
pub mod service_account;

pub use authenticator::AuthSource;
pub use bootstrap::BootstrapSnapshot;
pub use connection::{CallError, Connection, WeakConnection};
pub use service_account::{
    ServiceAccountTokenOptions, ServiceAccountTokenSource, TokenRequestError,
};
