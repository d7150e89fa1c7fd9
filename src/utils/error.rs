/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::io;

use http::StatusCode;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Failures while loading the root CA from disk.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to read CA material: {0}")]
    ReadFailure(#[from] io::Error),

    #[error("failed to parse CA material: {0}")]
    ParseFailure(String),

    #[error("unsupported CA key type: {0}")]
    UnsupportedKeyType(String),
}

/// Failures while minting a leaf certificate for a hostname.
#[derive(Debug, Clone, Error)]
pub enum IssuanceError {
    #[error("root key type cannot sign leaves: {0}")]
    UnsupportedKeyType(String),

    #[error("leaf signing failed: {0}")]
    SigningFailure(String),

    #[error("leaf issuance for {host} exceeded {budget_ms}ms")]
    Timeout { host: String, budget_ms: u64 },
}

#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error("resolution of {0} timed out")]
    Timeout(String),

    #[error("answer section for {0} was empty")]
    EmptyAnswer(String),

    #[error("no IPv4 address found for {0}")]
    EmptyResult(String),

    #[error("dns exchange with {nameserver} failed: {reason}")]
    Exchange { nameserver: String, reason: String },

    #[error("no nameservers configured")]
    NoNameservers,
}

impl ResolutionError {
    /// Transport failures and nameserver error codes are worth another nameserver.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolutionError::Exchange { .. })
    }
}

/// Per-request forwarding failures; each maps onto a 5xx response for the client.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("failed to dial {target}: {reason}")]
    DialFailure { target: String, reason: String },

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("request deadline exceeded while {0}")]
    Timeout(&'static str),

    #[error("client went away")]
    ClientGone,
}

impl ForwardError {
    pub fn dial(target: impl Into<String>, reason: impl ToString) -> Self {
        ForwardError::DialFailure {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn upstream(reason: impl ToString) -> Self {
        ForwardError::UpstreamError(reason.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ForwardError::Timeout(_) | ForwardError::Resolution(ResolutionError::Timeout(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Connection-level errors surfaced by the listener shell.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
