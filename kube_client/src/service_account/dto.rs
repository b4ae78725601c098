//! DTOs for the token issuance endpoint

use kube_tokens::Audience;
use serde::{Deserialize, Serialize};

/// The API version of token requests
pub const API_VERSION: &str = "authentication.k8s.io/v1";

/// The kind of token requests
pub const KIND: &str = "TokenRequest";

/// A request for a token bound to a service account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    /// Always [`API_VERSION`]
    pub api_version: String,
    /// Always [`KIND`]
    pub kind: String,
    /// What is being requested
    pub spec: TokenRequestSpec,
}

/// The parameters of a token request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequestSpec {
    /// The requested lifetime of the token
    pub expiration_seconds: u64,

    /// The intended audiences of the token
    ///
    /// Left out of the request when empty, so the server applies its default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<Audience>,
}

#[derive(Deserialize)]
pub(super) struct TokenRequestResponse {
    #[serde(default)]
    pub status: Option<TokenRequestStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TokenRequestStatus {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub expiration_timestamp: Option<String>,
}
