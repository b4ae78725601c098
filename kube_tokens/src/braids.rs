use aliri_braid::braid;
use std::fmt;
use thiserror::Error;

const ACCESS_TOKEN_REDACTED: &str = "***ACCESS TOKEN***";

/// Characters of an access token shown by `{:#?}` unless a width is given
const ACCESS_TOKEN_DEBUG_PREFIX: usize = 15;

/// A bearer token presented to the cluster API
///
/// Formatting hides the token. The alternate `Debug` form (`{:#?}`) shows a
/// short prefix, with the width (`{:#8?}`) choosing its length, and the
/// alternate `Display` form (`{:#}`) shows the whole token.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !f.alternate() {
            return f.write_str(ACCESS_TOKEN_REDACTED);
        }

        let visible = f.width().unwrap_or(ACCESS_TOKEN_DEBUG_PREFIX);
        f.write_str("\"")?;
        write_prefix(self.as_str(), f, visible)?;
        f.write_str("\"")
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str(self.as_str())
        } else {
            f.write_str(ACCESS_TOKEN_REDACTED)
        }
    }
}

/// Writes at most `width` characters of `secret`, the last being `…` when cut short
fn write_prefix(secret: &str, f: &mut fmt::Formatter, width: usize) -> fmt::Result {
    if width <= 1 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(width - 1) {
        Some((cut, _)) => {
            f.write_str(&secret[..cut])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// An intended audience of an issued token
#[braid(serde)]
pub struct Audience;

/// A name that cannot identify a cluster resource
#[derive(Debug, Error)]
pub enum InvalidResourceName {
    /// The name was the empty string
    #[error("resource name cannot be empty")]
    EmptyString,
    /// The name is longer than allowed
    #[error("resource name is longer than {max} bytes")]
    TooLong {
        /// The maximum allowed length
        max: usize,
    },
    /// The name contained a byte that is not allowed
    #[error("invalid resource name byte at position {position}: 0x{value:02x}")]
    InvalidByte {
        /// The index in the name where the invalid byte was found
        position: usize,
        /// The invalid byte value
        value: u8,
    },
    /// The name does not start and end with a lowercase letter or digit
    #[error("resource name must start and end with a lowercase letter or digit")]
    InvalidBoundary,
}

aliri_braid::from_infallible!(InvalidResourceName);

fn validate_resource_name(
    s: &str,
    max: usize,
    dots_allowed: bool,
) -> Result<(), InvalidResourceName> {
    let bytes = s.as_bytes();
    let alphanumeric = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if bytes.is_empty() {
        return Err(InvalidResourceName::EmptyString);
    }

    if bytes.len() > max {
        return Err(InvalidResourceName::TooLong { max });
    }

    if let Some((position, &value)) = bytes
        .iter()
        .enumerate()
        .find(|(_, &b)| !(alphanumeric(b) || b == b'-' || (dots_allowed && b == b'.')))
    {
        return Err(InvalidResourceName::InvalidByte { position, value });
    }

    if !alphanumeric(bytes[0]) || !alphanumeric(bytes[bytes.len() - 1]) {
        return Err(InvalidResourceName::InvalidBoundary);
    }

    Ok(())
}

/// The name of a namespace
///
/// A namespace name is a DNS label: at most 63 lowercase letters, digits,
/// and `-`, starting and ending with a letter or digit.
#[braid(
    serde,
    validator,
    ref_doc = "A borrowed reference to a [`NamespaceName`]"
)]
pub struct NamespaceName;

impl aliri_braid::Validator for NamespaceName {
    type Error = InvalidResourceName;

    fn validate(s: &str) -> Result<(), Self::Error> {
        validate_resource_name(s, 63, false)
    }
}

/// The name of a service account within a namespace
///
/// A service account name is a DNS subdomain: like a namespace name, but up
/// to 253 bytes long and also allowing `.`.
#[braid(
    serde,
    validator,
    ref_doc = "A borrowed reference to a [`ServiceAccountName`]"
)]
pub struct ServiceAccountName;

impl aliri_braid::Validator for ServiceAccountName {
    type Error = InvalidResourceName;

    fn validate(s: &str) -> Result<(), Self::Error> {
        validate_resource_name(s, 253, true)
    }
}
