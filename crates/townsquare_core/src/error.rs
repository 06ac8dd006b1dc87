/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;

pub type FedResult<T> = std::result::Result<T, FederationError>;

/// Errors surfaced to callers of the federation core.
///
/// Delivery problems are deliberately absent: they are reported as [`DeliveryFailure`] values
/// inside delivery reports and never abort the operation that triggered them.
///
/// [`DeliveryFailure`]: crate::delivery::DeliveryFailure
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("could not resolve {handle}: {reason}")]
    Resolution { handle: String, reason: String },
    #[error("no pending ownership challenge for {handle}")]
    ChallengeNotFound { handle: String },
    #[error("ownership challenge for {handle} has expired")]
    ChallengeExpired { handle: String },
    #[error("code for {handle} did not appear in its outbox within {}s", .waited.as_secs())]
    VerificationTimeout { handle: String, waited: Duration },
    #[error("actor not found: {0}")]
    ActorNotFound(String),
    #[error("invalid handle {handle:?}: {reason}")]
    InvalidHandle { handle: String, reason: &'static str },
    #[error("handle {handle} is already used by a {existing} actor")]
    HandleTaken { handle: String, existing: &'static str },
    #[error("invalid activity: {0}")]
    InvalidActivity(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// How bad a failure is for the operation that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation cannot continue.
    Fatal,
    /// Logged and reported; the operation still succeeds.
    Advisory,
}

impl FederationError {
    pub fn resolution(handle: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FederationError::Resolution {
            handle: handle.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            FederationError::Resolution { .. } => StatusCode::BAD_REQUEST,
            FederationError::ChallengeNotFound { .. } => StatusCode::NOT_FOUND,
            FederationError::ChallengeExpired { .. } => StatusCode::GONE,
            FederationError::VerificationTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            FederationError::ActorNotFound(_) => StatusCode::NOT_FOUND,
            FederationError::InvalidHandle { .. } => StatusCode::BAD_REQUEST,
            FederationError::HandleTaken { .. } => StatusCode::CONFLICT,
            FederationError::InvalidActivity(_) => StatusCode::BAD_REQUEST,
            FederationError::KeyGeneration(_) | FederationError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FederationError::KeyGeneration(_) | FederationError::Internal(_) => Severity::Fatal,
            _ => Severity::Advisory,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            FederationError::Resolution { .. } => "resolution_failed",
            FederationError::ChallengeNotFound { .. } => "challenge_not_found",
            FederationError::ChallengeExpired { .. } => "challenge_expired",
            FederationError::VerificationTimeout { .. } => "verification_timeout",
            FederationError::ActorNotFound(_) => "actor_not_found",
            FederationError::InvalidHandle { .. } => "invalid_handle",
            FederationError::HandleTaken { .. } => "handle_taken",
            FederationError::InvalidActivity(_) => "invalid_activity",
            FederationError::KeyGeneration(_) => "key_generation_failed",
            FederationError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!("federation error: {self:#}");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            axum::Json(serde_json::json!({ "error": self.code(), "message": message })),
        )
            .into_response()
    }
}
