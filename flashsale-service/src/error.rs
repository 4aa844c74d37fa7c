use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Expected purchase outcomes. These are routine contention results returned
/// to the caller as values for the UI to react to; they are never logged as
/// errors and never abort the surrounding transaction.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseRejection {
    #[error("{reason}")]
    NotActive { reason: String },

    #[error("minimum purchase for this sale is {min_purchase}")]
    BelowMinimum { min_purchase: BigDecimal },

    #[error("only {available} left in stock")]
    OutOfStock { available: BigDecimal },

    #[error("{remaining} of your {max_per_user} limit remaining")]
    LimitExceeded {
        remaining: BigDecimal,
        max_per_user: BigDecimal,
    },

    #[error("you already hold an active reservation for this sale")]
    DuplicateActiveReservation {
        reservation_id: Uuid,
        expires_at: DateTime<Utc>,
    },
}

impl PurchaseRejection {
    pub fn code(&self) -> &'static str {
        match self {
            PurchaseRejection::NotActive { .. } => "NOT_ACTIVE",
            PurchaseRejection::BelowMinimum { .. } => "BELOW_MINIMUM",
            PurchaseRejection::OutOfStock { .. } => "OUT_OF_STOCK",
            PurchaseRejection::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            PurchaseRejection::DuplicateActiveReservation { .. } => "DUPLICATE_ACTIVE_RESERVATION",
        }
    }
}

/// Faults and request errors. Only `Database`/`Pool` are true infrastructure
/// failures worth an error log; `LockTimeout` is surfaced to clients as a
/// retryable condition so hot sales fail fast instead of queueing.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("could not acquire the sale lock in time")]
    LockTimeout,

    #[error(transparent)]
    Database(diesel::result::Error),

    #[error(transparent)]
    Pool(#[from] diesel_async::pooled_connection::bb8::RunError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<diesel::result::Error> for ServiceError {
    fn from(e: diesel::result::Error) -> Self {
        // Postgres reports `lock_timeout` expiry (55P03) as a plain database
        // error; classify it here so every caller maps it the same way.
        if let diesel::result::Error::DatabaseError(_, info) = &e {
            if info.message().contains("lock timeout") {
                return ServiceError::LockTimeout;
            }
        }
        ServiceError::Database(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    #[test]
    fn rejection_codes() {
        let r = PurchaseRejection::OutOfStock {
            available: "4.00".parse().unwrap(),
        };
        assert_eq!(r.code(), "OUT_OF_STOCK");
        let r = PurchaseRejection::LimitExceeded {
            remaining: "1.00".parse().unwrap(),
            max_per_user: "5.00".parse().unwrap(),
        };
        assert_eq!(r.code(), "LIMIT_EXCEEDED");
    }

    #[test]
    fn rejection_serializes_with_code_tag() {
        let r = PurchaseRejection::OutOfStock {
            available: "2.50".parse().unwrap(),
        };
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["code"], "OUT_OF_STOCK");
        assert!(value.get("available").is_some());

        let r = PurchaseRejection::NotActive {
            reason: "this sale has ended".into(),
        };
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["code"], "NOT_ACTIVE");
        assert_eq!(value["reason"], "this sale has ended");
    }

    #[test]
    fn lock_timeout_is_classified() {
        let e = DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("canceling statement due to lock timeout".to_string()),
        );
        assert!(matches!(ServiceError::from(e), ServiceError::LockTimeout));

        let e = DieselError::NotFound;
        assert!(matches!(ServiceError::from(e), ServiceError::Database(_)));
    }
}
