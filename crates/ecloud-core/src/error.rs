// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ecloud-core.
//!
//! Provides a unified error type that maps to API error responses at the
//! controller boundary.

use serde::Serialize;
use std::fmt;

use crate::lock::LockError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Why a resource refused a new mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyReason {
    /// The latest unit of work is still in progress.
    InProgress,
    /// The resource never synced successfully and the mutation is an update.
    Failed,
}

impl BusyReason {
    /// Human-readable detail used in API responses.
    pub fn detail(&self) -> &'static str {
        match self {
            Self::InProgress => {
                "The specified resource is being modified and is unavailable at this time"
            }
            Self::Failed => {
                "The specified resource is in a failed state and cannot be modified at this time"
            }
        }
    }
}

/// Core errors that can occur while orchestrating mutations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The resource cannot accept a new mutation right now.
    ResourceBusy {
        /// The resource that refused the mutation.
        resource_id: String,
        /// Whether it is busy or failed.
        reason: BusyReason,
    },

    /// The per-resource lock could not be acquired within the wait budget.
    LockTimeout {
        /// The lock key that timed out.
        key: String,
    },

    /// The lock backend itself failed (connection, script error).
    LockBackend {
        /// Backend error description.
        details: String,
    },

    /// Resource was not found.
    ResourceNotFound {
        /// The resource ID that was not found.
        resource_id: String,
    },

    /// Unit of work was not found.
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// A chain referenced a step name that is not registered.
    UnknownStep {
        /// The unregistered step name.
        step: String,
    },

    /// Invalid input.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

/// Error payload returned across the controller boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    /// HTTP status the controller should respond with.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Short summary.
    pub title: String,
    /// Human-readable explanation.
    pub detail: String,
}

impl CoreError {
    /// Get the error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ResourceBusy { .. } => "RESOURCE_BUSY",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockBackend { .. } => "LOCK_BACKEND_ERROR",
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::UnknownStep { .. } => "UNKNOWN_STEP",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// HTTP status a controller should map this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ResourceBusy { .. } | Self::LockTimeout { .. } => 409,
            Self::ResourceNotFound { .. } | Self::TaskNotFound { .. } => 404,
            Self::ValidationError { .. } => 422,
            Self::UnknownStep { .. } | Self::LockBackend { .. } | Self::DatabaseError { .. } => {
                500
            }
        }
    }

    /// True when the caller may retry the same request later.
    pub fn is_conflict(&self) -> bool {
        self.http_status() == 409
    }

    /// Convert to the payload a controller returns to its client.
    pub fn to_api_error(&self) -> ApiError {
        let (title, detail) = match self {
            Self::ResourceBusy { reason, .. } => {
                ("Resource unavailable".to_string(), reason.detail().to_string())
            }
            Self::LockTimeout { .. } => (
                "Resource unavailable".to_string(),
                BusyReason::InProgress.detail().to_string(),
            ),
            Self::ResourceNotFound { .. } | Self::TaskNotFound { .. } => {
                ("Not found".to_string(), self.to_string())
            }
            Self::ValidationError { .. } => ("Validation error".to_string(), self.to_string()),
            _ => (
                "Internal server error".to_string(),
                "An unexpected error occurred".to_string(),
            ),
        };

        ApiError {
            status: self.http_status(),
            code: self.error_code(),
            title,
            detail,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceBusy {
                resource_id,
                reason,
            } => match reason {
                BusyReason::InProgress => {
                    write!(f, "Resource '{}' is being modified", resource_id)
                }
                BusyReason::Failed => write!(f, "Resource '{}' is in a failed state", resource_id),
            },
            Self::LockTimeout { key } => {
                write!(f, "Timed out waiting for sync lock '{}'", key)
            }
            Self::LockBackend { details } => write!(f, "Lock backend error: {}", details),
            Self::ResourceNotFound { resource_id } => {
                write!(f, "Resource '{}' not found", resource_id)
            }
            Self::TaskNotFound { task_id } => write!(f, "Task '{}' not found", task_id),
            Self::UnknownStep { step } => write!(f, "No step registered as '{}'", step),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error on '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during {}: {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<LockError> for CoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, .. } => CoreError::LockTimeout { key },
            LockError::Backend(details) => CoreError::LockBackend { details },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_codes_and_statuses() {
        let test_cases = vec![
            (
                CoreError::ResourceBusy {
                    resource_id: "rtr-1".to_string(),
                    reason: BusyReason::InProgress,
                },
                "RESOURCE_BUSY",
                409,
            ),
            (
                CoreError::LockTimeout {
                    key: "sync.rtr-1".to_string(),
                },
                "LOCK_TIMEOUT",
                409,
            ),
            (
                CoreError::ResourceNotFound {
                    resource_id: "rtr-1".to_string(),
                },
                "RESOURCE_NOT_FOUND",
                404,
            ),
            (
                CoreError::TaskNotFound {
                    task_id: "task-1".to_string(),
                },
                "TASK_NOT_FOUND",
                404,
            ),
            (
                CoreError::UnknownStep {
                    step: "nope".to_string(),
                },
                "UNKNOWN_STEP",
                500,
            ),
            (
                CoreError::ValidationError {
                    field: "id".to_string(),
                    message: "bad prefix".to_string(),
                },
                "VALIDATION_ERROR",
                422,
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
                500,
            ),
        ];

        for (error, expected_code, expected_status) in test_cases {
            assert_eq!(error.error_code(), expected_code, "code for {:?}", error);
            assert_eq!(error.http_status(), expected_status, "status for {:?}", error);
        }
    }

    #[test]
    fn test_busy_api_error_distinguishes_failed_from_in_progress() {
        let busy = CoreError::ResourceBusy {
            resource_id: "net-1".to_string(),
            reason: BusyReason::InProgress,
        }
        .to_api_error();
        assert_eq!(busy.status, 409);
        assert_eq!(busy.title, "Resource unavailable");
        assert_eq!(
            busy.detail,
            "The specified resource is being modified and is unavailable at this time"
        );

        let failed = CoreError::ResourceBusy {
            resource_id: "net-1".to_string(),
            reason: BusyReason::Failed,
        }
        .to_api_error();
        assert_eq!(failed.status, 409);
        assert!(failed.detail.contains("failed state"));
    }

    #[test]
    fn test_internal_errors_do_not_leak_details() {
        let api = CoreError::DatabaseError {
            operation: "query".to_string(),
            details: "password authentication failed".to_string(),
        }
        .to_api_error();

        assert_eq!(api.status, 500);
        assert!(!api.detail.contains("password"));
    }

    #[test]
    fn test_display_messages() {
        let err = CoreError::LockTimeout {
            key: "sync.vol-1".to_string(),
        };
        assert_eq!(err.to_string(), "Timed out waiting for sync lock 'sync.vol-1'");

        let err = CoreError::TaskNotFound {
            task_id: "task-abc".to_string(),
        };
        assert_eq!(err.to_string(), "Task 'task-abc' not found");
    }

    #[test]
    fn test_from_lock_error() {
        let err: CoreError = LockError::Timeout {
            key: "sync.i-1".to_string(),
            waited: Duration::from_secs(60),
        }
        .into();
        assert!(matches!(err, CoreError::LockTimeout { ref key } if key == "sync.i-1"));

        let err: CoreError = LockError::Backend("connection reset".to_string()).into();
        assert_eq!(err.error_code(), "LOCK_BACKEND_ERROR");
    }
}
