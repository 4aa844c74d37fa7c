use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleStatus {
    Scheduled,
    Active,
    Ended,
    SoldOut,
    Cancelled,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Scheduled => "SCHEDULED",
            SaleStatus::Active => "ACTIVE",
            SaleStatus::Ended => "ENDED",
            SaleStatus::SoldOut => "SOLD_OUT",
            SaleStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(SaleStatus::Scheduled),
            "ACTIVE" => Some(SaleStatus::Active),
            "ENDED" => Some(SaleStatus::Ended),
            "SOLD_OUT" => Some(SaleStatus::SoldOut),
            "CANCELLED" => Some(SaleStatus::Cancelled),
            _ => None,
        }
    }

    /// ENDED and CANCELLED accept no further transitions. SOLD_OUT can still
    /// move to ENDED by the lifecycle sweep.
    pub fn is_final(&self) -> bool {
        matches!(self, SaleStatus::Ended | SaleStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Converted,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Converted => "CONVERTED",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ReservationStatus::Active),
            "CONVERTED" => Some(ReservationStatus::Converted),
            "EXPIRED" => Some(ReservationStatus::Expired),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "PAID" => Some(OrderStatus::Paid),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REFUNDED" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

/// One flash sale: the authoritative stock counters plus the validity window.
/// `sold_quantity` and `reserved_quantity` are only ever mutated inside the
/// per-sale `FOR UPDATE` critical section or by the sweeper's conditional
/// single-row decrements, which keeps `sold + reserved <= total`.
#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::flash_sales)]
pub struct FlashSale {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub name: String,
    pub description: Option<String>,
    pub original_price: BigDecimal,
    pub flash_price: BigDecimal,
    pub total_quantity: BigDecimal,
    pub sold_quantity: BigDecimal,
    pub reserved_quantity: BigDecimal,
    pub max_per_user: BigDecimal,
    pub min_purchase: BigDecimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: String,
    pub priority: i32,
    pub is_featured: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlashSale {
    pub fn status(&self) -> SaleStatus {
        SaleStatus::parse(&self.status).unwrap_or(SaleStatus::Cancelled)
    }

    pub fn available_quantity(&self) -> BigDecimal {
        &self.total_quantity - &self.sold_quantity - &self.reserved_quantity
    }

    pub fn is_sold_out(&self) -> bool {
        self.available_quantity() <= BigDecimal::zero()
    }

    pub fn sold_percentage(&self) -> i32 {
        if self.total_quantity.is_zero() {
            return 0;
        }
        (&self.sold_quantity * BigDecimal::from(100) / &self.total_quantity)
            .to_i32()
            .unwrap_or(0)
    }

    pub fn discount_percent(&self) -> i32 {
        if self.original_price.is_zero() {
            return 0;
        }
        ((&self.original_price - &self.flash_price) * BigDecimal::from(100)
            / &self.original_price)
            .to_i32()
            .unwrap_or(0)
    }

    /// Seconds until the sale starts (SCHEDULED) or ends (ACTIVE).
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        match self.status() {
            SaleStatus::Scheduled => Some((self.start_time - now).num_seconds()),
            SaleStatus::Active => Some((self.end_time - now).num_seconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::flash_sales)]
pub struct NewFlashSale {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub name: String,
    pub description: Option<String>,
    pub original_price: BigDecimal,
    pub flash_price: BigDecimal,
    pub total_quantity: BigDecimal,
    pub sold_quantity: BigDecimal,
    pub reserved_quantity: BigDecimal,
    pub max_per_user: BigDecimal,
    pub min_purchase: BigDecimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: String,
    pub priority: i32,
    pub is_featured: bool,
}

/// A time-bound hold against a sale's stock. Exactly one ACTIVE row may
/// exist per (customer, sale); every transition out of ACTIVE is terminal
/// and guarded by `WHERE status = 'ACTIVE'` so racing writers settle it
/// exactly once.
#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: BigDecimal,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn status(&self) -> ReservationStatus {
        ReservationStatus::parse(&self.status).unwrap_or(ReservationStatus::Cancelled)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status() == ReservationStatus::Active && now > self.expires_at
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: BigDecimal,
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::flash_sale_orders)]
pub struct FlashSaleOrder {
    pub id: Uuid,
    pub order_code: String,
    pub sale_id: Uuid,
    pub reservation_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub total_amount: BigDecimal,
    pub discount_amount: BigDecimal,
    pub status: String,
    pub payment_method: Option<String>,
    pub payment_deadline: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipping_name: Option<String>,
    pub shipping_phone: Option<String>,
    pub shipping_address: Option<String>,
    pub customer_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlashSaleOrder {
    pub fn status(&self) -> OrderStatus {
        OrderStatus::parse(&self.status).unwrap_or(OrderStatus::Cancelled)
    }

    pub fn can_be_paid(&self, now: DateTime<Utc>) -> bool {
        self.status() == OrderStatus::Pending && now < self.payment_deadline
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.status() == OrderStatus::Pending
    }

    pub fn payment_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        if self.status() != OrderStatus::Pending {
            return 0;
        }
        (self.payment_deadline - now).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::flash_sale_orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_code: String,
    pub sale_id: Uuid,
    pub reservation_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub total_amount: BigDecimal,
    pub discount_amount: BigDecimal,
    pub status: String,
    pub payment_deadline: DateTime<Utc>,
    pub shipping_name: Option<String>,
    pub shipping_phone: Option<String>,
    pub shipping_address: Option<String>,
    pub customer_note: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_dead_letters)]
pub struct NewDeadLetter {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
}
