use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use shared::PurchaseSucceeded;

use crate::error::{PurchaseRejection, ServiceError};
use crate::models::*;
use crate::outbox;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Engine timing knobs, validated at startup. `payment_window` must not
/// exceed `hold_duration`: the sweeper releases a hold the moment it expires,
/// and an order must never stay payable after its stock went back to the pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hold_duration: Duration,
    pub payment_window: Duration,
    pub lock_timeout_ms: u32,
}

impl EngineConfig {
    pub fn new(
        hold_minutes: i64,
        payment_window_minutes: i64,
        lock_timeout_ms: u32,
    ) -> anyhow::Result<Self> {
        if hold_minutes <= 0 || payment_window_minutes <= 0 {
            anyhow::bail!("reservation hold and payment window must be positive");
        }
        if payment_window_minutes > hold_minutes {
            anyhow::bail!(
                "payment window ({payment_window_minutes}m) must not exceed the reservation hold ({hold_minutes}m)"
            );
        }
        if lock_timeout_ms == 0 {
            anyhow::bail!("lock timeout must be positive");
        }
        Ok(Self {
            hold_duration: Duration::minutes(hold_minutes),
            payment_window: Duration::minutes(payment_window_minutes),
            lock_timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShippingInfo {
    pub shipping_name: Option<String>,
    pub shipping_phone: Option<String>,
    pub shipping_address: Option<String>,
    pub customer_note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseSuccess {
    pub order_id: Uuid,
    pub order_code: String,
    pub reservation_id: Uuid,
    pub reservation_expires_at: DateTime<Utc>,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub total_amount: BigDecimal,
    pub discount_amount: BigDecimal,
    pub payment_deadline: DateTime<Utc>,
    pub payment_remaining_seconds: i64,
    pub remaining_stock: BigDecimal,
    pub user_total_purchased: BigDecimal,
    pub user_remaining_limit: BigDecimal,
}

#[derive(Debug)]
pub enum PurchaseOutcome {
    Success(Box<PurchaseSuccess>),
    Rejected(PurchaseRejection),
}

/// Quantity the customer has already committed against the sale: the sum of
/// their PENDING and PAID orders. Every ACTIVE reservation is created in the
/// same transaction as its PENDING order and settles with it, so this sum is
/// exactly the "active hold + non-terminal orders" commitment.
pub async fn committed_quantity(
    conn: &mut AsyncPgConnection,
    sale: Uuid,
    customer: Uuid,
) -> Result<BigDecimal, ServiceError> {
    let sum: Option<BigDecimal> = flash_sale_orders::table
        .filter(flash_sale_orders::sale_id.eq(sale))
        .filter(flash_sale_orders::customer_id.eq(customer))
        .filter(flash_sale_orders::status.eq_any([
            OrderStatus::Pending.as_str(),
            OrderStatus::Paid.as_str(),
        ]))
        .select(diesel::dsl::sum(flash_sale_orders::quantity))
        .first(conn)
        .await?;
    Ok(sum.unwrap_or_else(BigDecimal::zero))
}

/// The purchase decision over a locked sale snapshot. Pure so the check
/// ordering and every edge case are testable without a database. The caller
/// owns persisting the status flip some rejections imply (ENDED past the
/// window, SOLD_OUT at zero availability).
fn evaluate(
    sale: &FlashSale,
    now: DateTime<Utc>,
    quantity: &BigDecimal,
    committed: &BigDecimal,
    active_hold: Option<&Reservation>,
) -> Result<(), PurchaseRejection> {
    let reason = match sale.status() {
        SaleStatus::Cancelled => Some("this sale has been cancelled".to_string()),
        SaleStatus::Ended => Some("this sale has ended".to_string()),
        SaleStatus::SoldOut => Some("this sale is sold out".to_string()),
        SaleStatus::Scheduled => {
            if now < sale.start_time {
                let wait = (sale.start_time - now).num_seconds();
                Some(format!("this sale has not started, opens in {wait}s"))
            } else {
                Some("this sale has not been opened yet".to_string())
            }
        }
        SaleStatus::Active => None,
    };
    if let Some(reason) = reason {
        return Err(PurchaseRejection::NotActive { reason });
    }
    if now < sale.start_time {
        let wait = (sale.start_time - now).num_seconds();
        return Err(PurchaseRejection::NotActive {
            reason: format!("this sale has not started, opens in {wait}s"),
        });
    }
    if now >= sale.end_time {
        return Err(PurchaseRejection::NotActive {
            reason: "this sale has ended".to_string(),
        });
    }

    if quantity <= &BigDecimal::zero() || quantity < &sale.min_purchase {
        return Err(PurchaseRejection::BelowMinimum {
            min_purchase: sale.min_purchase.clone(),
        });
    }

    let available = sale.available_quantity();
    if &available < quantity {
        return Err(PurchaseRejection::OutOfStock { available });
    }

    let remaining = &sale.max_per_user - committed;
    if &remaining < quantity {
        return Err(PurchaseRejection::LimitExceeded {
            remaining,
            max_per_user: sale.max_per_user.clone(),
        });
    }

    // Checked last so an over-cap request reports LIMIT_EXCEEDED with the
    // remaining allowance instead of hiding behind the duplicate rejection.
    if let Some(hold) = active_hold {
        return Err(PurchaseRejection::DuplicateActiveReservation {
            reservation_id: hold.id,
            expires_at: hold.expires_at,
        });
    }

    Ok(())
}

/// Persist the sale-status flip a rejection observed under the lock: a
/// purchase attempt past `end_time` ends the sale, and one that found zero
/// availability marks it sold out.
async fn apply_rejection_side_effects(
    conn: &mut AsyncPgConnection,
    sale: &FlashSale,
    now: DateTime<Utc>,
    rejection: &PurchaseRejection,
) -> Result<(), ServiceError> {
    let new_status = match rejection {
        PurchaseRejection::NotActive { .. }
            if sale.status() == SaleStatus::Active && now >= sale.end_time =>
        {
            Some(SaleStatus::Ended)
        }
        PurchaseRejection::OutOfStock { .. }
            if sale.status() == SaleStatus::Active && sale.is_sold_out() =>
        {
            Some(SaleStatus::SoldOut)
        }
        _ => None,
    };

    if let Some(status) = new_status {
        diesel::update(flash_sales::table.find(sale.id))
            .set((
                flash_sales::status.eq(status.as_str()),
                flash_sales::updated_at.eq(now),
            ))
            .execute(conn)
            .await?;
        info!("flash sale {} moved to {}", sale.id, status.as_str());
    }
    Ok(())
}

fn generate_order_code(now: DateTime<Utc>) -> String {
    format!(
        "FS-{}-{:06X}",
        now.timestamp_millis(),
        rand::random::<u32>() & 0xFF_FFFF
    )
}

/// The purchase critical section, serialized per sale by a `FOR UPDATE` lock
/// on the sale row. Everything — stock check, limit check, reservation,
/// order, outbox event — commits together or not at all. No external I/O
/// happens while the lock is held, and `SET LOCAL lock_timeout` bounds the
/// wait so contended requests fail fast as a retryable condition.
pub async fn purchase(
    pool: &DbPool,
    config: &EngineConfig,
    sale_id: Uuid,
    customer_id: Uuid,
    quantity: BigDecimal,
    shipping: ShippingInfo,
) -> Result<PurchaseOutcome, ServiceError> {
    let mut conn = pool.get().await?;
    let hold_duration = config.hold_duration;
    let payment_window = config.payment_window;
    let lock_timeout_ms = config.lock_timeout_ms;

    let outcome = conn
        .transaction::<PurchaseOutcome, ServiceError, _>(|conn| {
            Box::pin(async move {
                diesel::sql_query(format!("SET LOCAL lock_timeout = '{lock_timeout_ms}ms'"))
                    .execute(conn)
                    .await?;

                let sale: FlashSale = flash_sales::table
                    .find(sale_id)
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or(ServiceError::NotFound("flash sale"))?;

                let now = Utc::now();
                let committed = committed_quantity(conn, sale_id, customer_id).await?;
                let active_hold: Option<Reservation> = reservations::table
                    .filter(reservations::sale_id.eq(sale_id))
                    .filter(reservations::customer_id.eq(customer_id))
                    .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
                    .first(conn)
                    .await
                    .optional()?;

                if let Err(rejection) =
                    evaluate(&sale, now, &quantity, &committed, active_hold.as_ref())
                {
                    apply_rejection_side_effects(conn, &sale, now, &rejection).await?;
                    debug!(
                        "purchase rejected: sale={} customer={} code={}",
                        sale_id,
                        customer_id,
                        rejection.code()
                    );
                    return Ok(PurchaseOutcome::Rejected(rejection));
                }

                let reservation = NewReservation {
                    id: Uuid::new_v4(),
                    sale_id,
                    customer_id,
                    quantity: quantity.clone(),
                    status: ReservationStatus::Active.as_str().to_string(),
                    expires_at: now + hold_duration,
                };
                diesel::insert_into(reservations::table)
                    .values(&reservation)
                    .execute(conn)
                    .await?;

                diesel::update(flash_sales::table.find(sale_id))
                    .set((
                        flash_sales::reserved_quantity
                            .eq(flash_sales::reserved_quantity + quantity.clone()),
                        flash_sales::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                let total_amount = &sale.flash_price * &quantity;
                let discount_amount = (&sale.original_price - &sale.flash_price) * &quantity;
                let payment_deadline = now + payment_window;
                let order = NewOrder {
                    id: Uuid::new_v4(),
                    order_code: generate_order_code(now),
                    sale_id,
                    reservation_id: reservation.id,
                    customer_id,
                    quantity: quantity.clone(),
                    unit_price: sale.flash_price.clone(),
                    total_amount: total_amount.clone(),
                    discount_amount: discount_amount.clone(),
                    status: OrderStatus::Pending.as_str().to_string(),
                    payment_deadline,
                    shipping_name: shipping.shipping_name,
                    shipping_phone: shipping.shipping_phone,
                    shipping_address: shipping.shipping_address,
                    customer_note: shipping.customer_note,
                };
                diesel::insert_into(flash_sale_orders::table)
                    .values(&order)
                    .execute(conn)
                    .await?;

                let event = PurchaseSucceeded {
                    order_id: order.id,
                    order_code: order.order_code.clone(),
                    sale_id,
                    customer_id,
                    quantity: quantity.clone(),
                    unit_price: sale.flash_price.clone(),
                    total_amount: total_amount.clone(),
                    payment_deadline,
                };
                outbox::enqueue(
                    conn,
                    order.id,
                    PurchaseSucceeded::EVENT_TYPE,
                    serde_json::to_value(&event)?,
                )
                .await?;

                info!(
                    "purchase succeeded: sale={} customer={} order={} quantity={}",
                    sale_id, customer_id, order.order_code, quantity
                );

                let user_total_purchased = &committed + &quantity;
                Ok(PurchaseOutcome::Success(Box::new(PurchaseSuccess {
                    order_id: order.id,
                    order_code: order.order_code,
                    reservation_id: reservation.id,
                    reservation_expires_at: reservation.expires_at,
                    quantity: quantity.clone(),
                    unit_price: order.unit_price,
                    total_amount,
                    discount_amount,
                    payment_deadline,
                    payment_remaining_seconds: (payment_deadline - now).num_seconds(),
                    remaining_stock: sale.available_quantity() - &quantity,
                    user_remaining_limit: &sale.max_per_user - &user_total_purchased,
                    user_total_purchased,
                })))
            })
        })
        .await?;

    Ok(outcome)
}

/// PENDING → PAID before the deadline, converting the backing reservation.
/// Runs under the same per-sale lock as `purchase`; the conditional
/// `ACTIVE → CONVERTED` update settles the race against the expiry sweep
/// exactly once — zero rows touched means the hold is already gone.
pub async fn confirm_payment(
    pool: &DbPool,
    config: &EngineConfig,
    order_id: Uuid,
    customer_id: Uuid,
    payment_method: String,
) -> Result<FlashSaleOrder, ServiceError> {
    let mut conn = pool.get().await?;
    let lock_timeout_ms = config.lock_timeout_ms;

    let order = conn
        .transaction::<FlashSaleOrder, ServiceError, _>(|conn| {
            Box::pin(async move {
                diesel::sql_query(format!("SET LOCAL lock_timeout = '{lock_timeout_ms}ms'"))
                    .execute(conn)
                    .await?;

                let order: FlashSaleOrder = flash_sale_orders::table
                    .find(order_id)
                    .filter(flash_sale_orders::customer_id.eq(customer_id))
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or(ServiceError::NotFound("order"))?;

                let now = Utc::now();
                if order.status() != OrderStatus::Pending {
                    return Err(ServiceError::Validation(
                        "only pending orders can be paid".into(),
                    ));
                }
                if now >= order.payment_deadline {
                    return Err(ServiceError::Validation(
                        "the payment deadline has passed".into(),
                    ));
                }

                let sale: FlashSale = flash_sales::table
                    .find(order.sale_id)
                    .for_update()
                    .first(conn)
                    .await?;

                let converted = diesel::update(
                    reservations::table
                        .find(order.reservation_id)
                        .filter(reservations::status.eq(ReservationStatus::Active.as_str())),
                )
                .set((
                    reservations::status.eq(ReservationStatus::Converted.as_str()),
                    reservations::converted_at.eq(now),
                ))
                .execute(conn)
                .await?;
                if converted == 0 {
                    return Err(ServiceError::Validation(
                        "the stock hold for this order has expired".into(),
                    ));
                }

                let new_reserved = &sale.reserved_quantity - &order.quantity;
                let new_sold = &sale.sold_quantity + &order.quantity;
                let sold_out = sale.status() == SaleStatus::Active
                    && &sale.total_quantity - &new_sold - &new_reserved <= BigDecimal::zero();
                let new_status = if sold_out {
                    SaleStatus::SoldOut.as_str().to_string()
                } else {
                    sale.status.clone()
                };
                diesel::update(flash_sales::table.find(sale.id))
                    .set((
                        flash_sales::reserved_quantity.eq(new_reserved),
                        flash_sales::sold_quantity.eq(new_sold),
                        flash_sales::status.eq(new_status),
                        flash_sales::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                let paid: FlashSaleOrder = diesel::update(flash_sale_orders::table.find(order.id))
                    .set((
                        flash_sale_orders::status.eq(OrderStatus::Paid.as_str()),
                        flash_sale_orders::payment_method.eq(Some(payment_method)),
                        flash_sale_orders::paid_at.eq(Some(now)),
                        flash_sale_orders::updated_at.eq(now),
                    ))
                    .get_result(conn)
                    .await?;

                info!("payment confirmed: order={}", paid.order_code);
                Ok(paid)
            })
        })
        .await?;

    Ok(order)
}

/// Customer-initiated cancellation of a PENDING order. Releases the hold's
/// quantity only when the conditional `ACTIVE → CANCELLED` update touched a
/// row; a hold the sweeper already expired must not be released twice.
pub async fn cancel_order(
    pool: &DbPool,
    config: &EngineConfig,
    order_id: Uuid,
    customer_id: Uuid,
) -> Result<FlashSaleOrder, ServiceError> {
    let mut conn = pool.get().await?;
    let lock_timeout_ms = config.lock_timeout_ms;

    let order = conn
        .transaction::<FlashSaleOrder, ServiceError, _>(|conn| {
            Box::pin(async move {
                diesel::sql_query(format!("SET LOCAL lock_timeout = '{lock_timeout_ms}ms'"))
                    .execute(conn)
                    .await?;

                let order: FlashSaleOrder = flash_sale_orders::table
                    .find(order_id)
                    .filter(flash_sale_orders::customer_id.eq(customer_id))
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or(ServiceError::NotFound("order"))?;

                if order.status() != OrderStatus::Pending {
                    return Err(ServiceError::Validation(
                        "only pending orders can be cancelled".into(),
                    ));
                }

                let now = Utc::now();
                let _sale: FlashSale = flash_sales::table
                    .find(order.sale_id)
                    .for_update()
                    .first(conn)
                    .await?;

                let released = diesel::update(
                    reservations::table
                        .find(order.reservation_id)
                        .filter(reservations::status.eq(ReservationStatus::Active.as_str())),
                )
                .set(reservations::status.eq(ReservationStatus::Cancelled.as_str()))
                .execute(conn)
                .await?;
                if released > 0 {
                    diesel::update(flash_sales::table.find(order.sale_id))
                        .set((
                            flash_sales::reserved_quantity
                                .eq(flash_sales::reserved_quantity - order.quantity.clone()),
                            flash_sales::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                }

                let cancelled: FlashSaleOrder =
                    diesel::update(flash_sale_orders::table.find(order.id))
                        .set((
                            flash_sale_orders::status.eq(OrderStatus::Cancelled.as_str()),
                            flash_sale_orders::updated_at.eq(now),
                        ))
                        .get_result(conn)
                        .await?;

                info!("order cancelled: order={}", cancelled.order_code);
                Ok(cancelled)
            })
        })
        .await?;

    Ok(order)
}

/// Administrative refund: PAID → REFUNDED. Sold stock is not returned to the
/// pool; the sale keeps its counters.
pub async fn refund_order(pool: &DbPool, order_id: Uuid) -> Result<FlashSaleOrder, ServiceError> {
    let mut conn = pool.get().await?;

    let order: FlashSaleOrder = flash_sale_orders::table
        .find(order_id)
        .first(&mut conn)
        .await
        .optional()?
        .ok_or(ServiceError::NotFound("order"))?;

    if order.status() != OrderStatus::Paid {
        return Err(ServiceError::Validation(
            "only paid orders can be refunded".into(),
        ));
    }

    let refunded: FlashSaleOrder = diesel::update(flash_sale_orders::table.find(order.id))
        .set((
            flash_sale_orders::status.eq(OrderStatus::Refunded.as_str()),
            flash_sale_orders::updated_at.eq(Utc::now()),
        ))
        .get_result(&mut conn)
        .await?;

    info!("order refunded: order={}", refunded.order_code);
    Ok(refunded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    fn active_sale(total: &str, max_per_user: &str, min_purchase: &str) -> FlashSale {
        let now = Utc::now();
        FlashSale {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_name: "Linen".into(),
            name: "Linen flash".into(),
            description: None,
            original_price: dec("200.00"),
            flash_price: dec("150.00"),
            total_quantity: dec(total),
            sold_quantity: BigDecimal::zero(),
            reserved_quantity: BigDecimal::zero(),
            max_per_user: dec(max_per_user),
            min_purchase: dec(min_purchase),
            start_time: now - Duration::hours(1),
            end_time: now + Duration::hours(1),
            status: "ACTIVE".into(),
            priority: 0,
            is_featured: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn hold(sale: &FlashSale, customer: Uuid, quantity: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            sale_id: sale.id,
            customer_id: customer,
            quantity: dec(quantity),
            status: "ACTIVE".into(),
            expires_at: now + Duration::minutes(10),
            converted_at: None,
            created_at: now,
        }
    }

    /// Serialized application of the orchestrator's decision + counter
    /// mutation, mirroring what the per-sale lock makes atomic.
    fn attempt(
        sale: &mut FlashSale,
        committed: &mut HashMap<Uuid, BigDecimal>,
        customer: Uuid,
        quantity: &str,
    ) -> Result<(), PurchaseRejection> {
        let quantity = dec(quantity);
        let now = Utc::now();
        let spent = committed.entry(customer).or_insert_with(BigDecimal::zero);
        evaluate(sale, now, &quantity, spent, None)?;
        sale.reserved_quantity = &sale.reserved_quantity + &quantity;
        *spent = &*spent + &quantity;
        Ok(())
    }

    #[test]
    fn sequential_contention_never_oversells() {
        // total=10, two requests for 6: the second sees available=4.
        let mut sale = active_sale("10.00", "10.00", "0.50");
        let mut committed = HashMap::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(attempt(&mut sale, &mut committed, a, "6.00").is_ok());
        match attempt(&mut sale, &mut committed, b, "6.00") {
            Err(PurchaseRejection::OutOfStock { available }) => {
                assert_eq!(available, dec("4.00"));
            }
            other => panic!("expected OUT_OF_STOCK, got {other:?}"),
        }
        assert!(&sale.sold_quantity + &sale.reserved_quantity <= sale.total_quantity);
    }

    #[test]
    fn limit_exceeded_carries_remaining_allowance() {
        // max_per_user=5, customer already committed 4, requests 2 more.
        let sale = active_sale("100.00", "5.00", "0.50");
        let customer = Uuid::new_v4();
        let existing = hold(&sale, customer, "4.00");
        let result = evaluate(
            &sale,
            Utc::now(),
            &dec("2.00"),
            &dec("4.00"),
            Some(&existing),
        );
        match result {
            Err(PurchaseRejection::LimitExceeded {
                remaining,
                max_per_user,
            }) => {
                assert_eq!(remaining, dec("1.00"));
                assert_eq!(max_per_user, dec("5.00"));
            }
            other => panic!("expected LIMIT_EXCEEDED, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_hold_rejected_after_limit_check() {
        let sale = active_sale("100.00", "5.00", "0.50");
        let customer = Uuid::new_v4();
        let existing = hold(&sale, customer, "2.00");
        // Within the cap, but an active hold already exists.
        let result = evaluate(
            &sale,
            Utc::now(),
            &dec("1.00"),
            &dec("2.00"),
            Some(&existing),
        );
        match result {
            Err(PurchaseRejection::DuplicateActiveReservation { reservation_id, .. }) => {
                assert_eq!(reservation_id, existing.id);
            }
            other => panic!("expected DUPLICATE_ACTIVE_RESERVATION, got {other:?}"),
        }
    }

    #[test]
    fn scheduled_sale_rejects_until_activated() {
        let mut sale = active_sale("10.00", "5.00", "0.50");
        sale.status = "SCHEDULED".into();
        sale.start_time = Utc::now() + Duration::hours(1);

        let result = evaluate(&sale, Utc::now(), &dec("1.00"), &BigDecimal::zero(), None);
        assert!(matches!(
            result,
            Err(PurchaseRejection::NotActive { .. })
        ));

        // The lifecycle sweep crossing start_time makes the same request pass.
        sale.status = "ACTIVE".into();
        sale.start_time = Utc::now() - Duration::minutes(1);
        assert!(evaluate(&sale, Utc::now(), &dec("1.00"), &BigDecimal::zero(), None).is_ok());
    }

    #[test]
    fn below_minimum_rejected() {
        let sale = active_sale("10.00", "5.00", "0.50");
        let result = evaluate(&sale, Utc::now(), &dec("0.30"), &BigDecimal::zero(), None);
        match result {
            Err(PurchaseRejection::BelowMinimum { min_purchase }) => {
                assert_eq!(min_purchase, dec("0.50"));
            }
            other => panic!("expected BELOW_MINIMUM, got {other:?}"),
        }

        let result = evaluate(&sale, Utc::now(), &dec("0.00"), &BigDecimal::zero(), None);
        assert!(matches!(result, Err(PurchaseRejection::BelowMinimum { .. })));
    }

    #[test]
    fn past_end_time_rejects_even_while_active() {
        let mut sale = active_sale("10.00", "5.00", "0.50");
        sale.end_time = Utc::now() - Duration::minutes(1);
        let result = evaluate(&sale, Utc::now(), &dec("1.00"), &BigDecimal::zero(), None);
        assert!(matches!(result, Err(PurchaseRejection::NotActive { .. })));
    }

    #[test]
    fn randomized_attempts_hold_the_stock_invariant() {
        let mut sale = active_sale("10.00", "5.00", "0.50");
        let mut committed: HashMap<Uuid, BigDecimal> = HashMap::new();
        let customers: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        for i in 0..40 {
            let customer = customers[i % customers.len()];
            let quantity = format!("{}.50", (rand::random::<u32>() % 3) + 1);
            let _ = attempt(&mut sale, &mut committed, customer, &quantity);

            let held = &sale.sold_quantity + &sale.reserved_quantity;
            assert!(held <= sale.total_quantity, "oversold: {held}");
        }
        for spent in committed.values() {
            assert!(spent <= &sale.max_per_user, "over the per-user cap: {spent}");
        }

        // A subsequent sweep releasing every hold restores the full pool.
        sale.reserved_quantity = BigDecimal::zero();
        assert!(sale.available_quantity() <= sale.total_quantity);
    }

    #[test]
    fn engine_config_rejects_payment_window_longer_than_hold() {
        assert!(EngineConfig::new(10, 10, 3000).is_ok());
        assert!(EngineConfig::new(10, 15, 3000).is_err());
        assert!(EngineConfig::new(0, 0, 3000).is_err());
        assert!(EngineConfig::new(10, 5, 0).is_err());
    }

    #[test]
    fn order_codes_are_prefixed_and_unique_enough() {
        let now = Utc::now();
        let code = generate_order_code(now);
        assert!(code.starts_with("FS-"));
        let suffix = code.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
