use std::{borrow::Cow, error};

use thiserror::Error;

type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// A credential could not be obtained
///
/// This is the only error surfaced by a [`TokenProvider`](crate::TokenProvider),
/// whatever the strategy behind it. The strategy's own failure is kept as the
/// [`source`](error::Error::source) of this error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthenticationError {
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxError>,
}

impl AuthenticationError {
    /// Constructs an error with no underlying cause
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Constructs an error wrapping the underlying cause
    pub fn with_source<E>(message: impl Into<Cow<'static, str>>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The top-level description of the failure
    pub fn message(&self) -> &str {
        &self.message
    }
}
