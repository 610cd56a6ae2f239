//! Error taxonomy shared by every desk operation.
//!
//! Domain code returns `DeskResult<T>`; the HTTP layer turns a `DeskError`
//! into a status code plus the `{success: false, error}` body the frontend
//! renders as a toast.

use std::fmt;

/// Step of the payment workflow, recorded when a step fails so the log
/// shows how far the non-transactional chain got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStep {
    InsertLineItems,
    InsertReceipt,
    CompleteLineItems,
    DeductStock,
}

impl fmt::Display for PaymentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentStep::InsertLineItems => "insert_line_items",
            PaymentStep::InsertReceipt => "insert_receipt",
            PaymentStep::CompleteLineItems => "complete_line_items",
            PaymentStep::DeductStock => "deduct_stock",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeskError {
    /// Barcode, client, receipt or stock lookup miss.
    #[error("{0}")]
    NotFound(String),
    /// Missing or malformed input.
    #[error("{0}")]
    Validation(String),
    /// Non-2xx or `success: false` response from the remote data service.
    #[error("{0}")]
    Remote(String),
    /// Missing, expired or rejected staff session.
    #[error("{0}")]
    Unauthorized(String),
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    /// Failure outside the domain (worker task panicked, I/O at startup).
    #[error("{0}")]
    Internal(String),
    #[error("payment workflow failed at {step}: {source}")]
    Workflow {
        step: PaymentStep,
        #[source]
        source: Box<DeskError>,
    },
}

pub type DeskResult<T> = Result<T, DeskError>;

impl DeskError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        DeskError::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DeskError::Validation(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        DeskError::Remote(msg.into())
    }

    /// Wrap an error raised inside a payment workflow step.
    pub fn at_step(step: PaymentStep) -> impl FnOnce(DeskError) -> DeskError {
        move |source| DeskError::Workflow {
            step,
            source: Box::new(source),
        }
    }

    /// Short machine-readable kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            DeskError::NotFound(_) => "not_found",
            DeskError::Validation(_) => "validation",
            DeskError::Remote(_) => "remote",
            DeskError::Unauthorized(_) => "unauthorized",
            DeskError::Storage(_) => "storage",
            DeskError::LockPoisoned => "lock_poisoned",
            DeskError::Internal(_) => "internal",
            DeskError::Workflow { .. } => "workflow",
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DeskError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        DeskError::LockPoisoned
    }
}
