//! A credential source that runs an external credential plugin
//!
//! The plugin is run once per refresh. It receives a description of the
//! request in the `KUBERNETES_EXEC_INFO` environment variable and must print an
//! `ExecCredential` document to standard output:
//!
//! ```json
//! {
//!   "apiVersion": "client.authentication.k8s.io/v1",
//!   "kind": "ExecCredential",
//!   "status": {
//!     "token": "my-bearer-token",
//!     "expirationTimestamp": "2030-01-01T00:00:00Z"
//!   }
//! }
//! ```
//!
//! A missing `expirationTimestamp` yields a credential that never expires.

use std::{ffi::OsString, io, process::ExitStatus};

use async_trait::async_trait;
use kube_clock::{InvalidTimestamp, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use super::CredentialSource;
use crate::Credential;

const EXEC_INFO_ENV: &str = "KUBERNETES_EXEC_INFO";
const API_VERSION: &str = "client.authentication.k8s.io/v1";

/// A credential source backed by an external command
#[derive(Debug)]
pub struct ExecCredentialSource {
    command: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl ExecCredentialSource {
    /// Constructs a new source that runs `command`
    pub fn new(command: impl Into<OsString>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends arguments passed to the command
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable set for the command
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// An error while running a credential plugin
#[derive(Debug, Error)]
pub enum ExecCredentialError {
    /// Unable to serialize the request passed to the plugin
    #[error("error serializing exec info for credential plugin")]
    ExecInfo(#[source] serde_json::Error),
    /// Unable to start the plugin or collect its output
    #[error("error running credential plugin {command:?}")]
    Spawn {
        /// The command that was run
        command: OsString,
        /// The underlying I/O error
        source: io::Error,
    },
    /// The plugin exited unsuccessfully
    #[error("credential plugin exited with {status}: {stderr}")]
    ExitStatus {
        /// The exit status of the plugin
        status: ExitStatus,
        /// Whatever the plugin wrote to standard error
        stderr: String,
    },
    /// The plugin output was not an `ExecCredential` document
    #[error("error deserializing credential plugin output")]
    Output(#[source] serde_json::Error),
    /// The plugin output did not contain a token
    #[error("credential plugin output missing status.token")]
    MissingToken,
    /// The plugin reported an unreadable expiry
    #[error("credential plugin reported an invalid expiration timestamp")]
    InvalidExpiration(#[source] InvalidTimestamp),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecInfo {
    api_version: &'static str,
    kind: &'static str,
    spec: ExecInfoSpec,
}

#[derive(Serialize)]
struct ExecInfoSpec {
    interactive: bool,
}

#[derive(Deserialize)]
struct ExecCredential {
    #[serde(default)]
    status: Option<ExecCredentialStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration_timestamp: Option<String>,
}

#[async_trait]
impl CredentialSource for ExecCredentialSource {
    type Error = ExecCredentialError;

    #[tracing::instrument(err, skip(self), fields(command = ?self.command))]
    async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
        let exec_info = serde_json::to_string(&ExecInfo {
            api_version: API_VERSION,
            kind: "ExecCredential",
            spec: ExecInfoSpec { interactive: false },
        })
        .map_err(ExecCredentialError::ExecInfo)?;

        tracing::trace!("running credential plugin");

        let output = Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .env(EXEC_INFO_ENV, exec_info)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExecCredentialError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecCredentialError::ExitStatus {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let credential: ExecCredential =
            serde_json::from_slice(&output.stdout).map_err(ExecCredentialError::Output)?;
        let status = credential
            .status
            .ok_or(ExecCredentialError::MissingToken)?;
        let token = status.token.ok_or(ExecCredentialError::MissingToken)?;

        let expires_at = status
            .expiration_timestamp
            .as_deref()
            .map(UnixTime::parse_rfc3339)
            .transpose()
            .map_err(ExecCredentialError::InvalidExpiration)?;

        tracing::debug!(
            expires_at = expires_at.map(|t| t.0),
            "credential plugin returned token"
        );

        Ok(Credential::new(token, expires_at))
    }
}
