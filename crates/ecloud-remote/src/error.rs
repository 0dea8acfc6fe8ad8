// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote API errors.

use ecloud_core::chain::StepError;
use thiserror::Error;

/// Failure talking to a remote API.
///
/// Status errors render as `remote error: <status> <body>` so the remote's
/// own explanation ends up in the task's failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote rejected the request (4xx).
    #[error("remote error: {status} {body}")]
    Client {
        /// HTTP status.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// The remote failed (5xx).
    #[error("remote error: {status} {body}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// The request never got a response (connect, TLS, timeout).
    #[error("remote transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("remote decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Build the error for a non-success status.
    pub fn from_status(status: u16, body: String) -> Self {
        if status >= 500 {
            Self::Server { status, body }
        } else {
            Self::Client { status, body }
        }
    }

    /// HTTP status, if the remote answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Transport(_) | Self::Decode(_) => None,
        }
    }

    /// True for a 404.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<RemoteError> for StepError {
    fn from(err: RemoteError) -> Self {
        StepError::Failed(err.to_string())
    }
}
