use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published after a purchase transaction commits. Consumed by the
/// notification and analytics collaborators; delivery is at-least-once and
/// best-effort, the purchase itself never depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseSucceeded {
    pub order_id: Uuid,
    pub order_code: String,
    pub sale_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub total_amount: BigDecimal,
    pub payment_deadline: DateTime<Utc>,
}

/// Published when the sweeper releases an expired hold back to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationExpired {
    pub reservation_id: Uuid,
    pub sale_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: BigDecimal,
}

impl PurchaseSucceeded {
    pub const EVENT_TYPE: &'static str = "PurchaseSucceeded";
}

impl ReservationExpired {
    pub const EVENT_TYPE: &'static str = "ReservationExpired";
}
