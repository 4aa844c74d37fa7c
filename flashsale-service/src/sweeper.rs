use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use shared::ReservationExpired;

use crate::models::*;
use crate::outbox;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Scheduled maintenance over reservations, orders and sale lifecycle.
/// Every pass is an idempotent conditional mutation, so any number of
/// service instances can run their own timers without coordination: the
/// `WHERE status = 'ACTIVE'` / `WHERE status = 'PENDING'` guards let
/// exactly one writer win each row.
#[derive(Clone)]
pub struct Sweeper {
    pool: DbPool,
}

impl Sweeper {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run_reservation_expiry(&self, period: Duration) {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            match self.release_expired_reservations().await {
                Ok(0) => {}
                Ok(n) => info!("released {} expired reservations", n),
                Err(e) => error!("reservation expiry sweep failed: {}", e),
            }
        }
    }

    pub async fn run_order_expiry(&self, period: Duration) {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            match self.expire_pending_orders().await {
                Ok(0) => {}
                Ok(n) => info!("expired {} pending orders", n),
                Err(e) => error!("order expiry sweep failed: {}", e),
            }
        }
    }

    pub async fn run_lifecycle(&self, period: Duration) {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            match self.advance_sale_lifecycle().await {
                Ok((0, 0)) => {}
                Ok((activated, ended)) => {
                    info!("lifecycle sweep: activated={} ended={}", activated, ended)
                }
                Err(e) => error!("lifecycle sweep failed: {}", e),
            }
        }
    }

    /// Expire every ACTIVE reservation past its deadline, releasing its
    /// quantity back to the owning sale. Strictly per row: a reservation a
    /// racing payment confirmation already CONVERTED is skipped, never
    /// double-released, and one bad row does not abort the pass.
    async fn release_expired_reservations(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let due: Vec<Reservation> = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
            .filter(reservations::expires_at.lt(now))
            .order(reservations::expires_at.asc())
            .limit(200)
            .load(&mut conn)
            .await?;

        let mut released = 0;
        for reservation in due {
            match Self::release_one(&mut conn, &reservation).await {
                Ok(true) => released += 1,
                Ok(false) => {} // settled by a racing writer in the meantime
                Err(e) => error!("failed to release reservation {}: {}", reservation.id, e),
            }
        }
        Ok(released)
    }

    async fn release_one(conn: &mut AsyncPgConnection, reservation: &Reservation) -> Result<bool> {
        let id = reservation.id;
        let sale_id = reservation.sale_id;
        let customer_id = reservation.customer_id;
        let quantity = reservation.quantity.clone();

        conn.transaction::<bool, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let expired = diesel::update(
                    reservations::table
                        .find(id)
                        .filter(reservations::status.eq(ReservationStatus::Active.as_str())),
                )
                .set(reservations::status.eq(ReservationStatus::Expired.as_str()))
                .execute(conn)
                .await?;
                if expired == 0 {
                    return Ok(false);
                }

                diesel::update(flash_sales::table.find(sale_id))
                    .set((
                        flash_sales::reserved_quantity
                            .eq(flash_sales::reserved_quantity - quantity.clone()),
                        flash_sales::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                let event = ReservationExpired {
                    reservation_id: id,
                    sale_id,
                    customer_id,
                    quantity,
                };
                outbox::enqueue(
                    conn,
                    id,
                    ReservationExpired::EVENT_TYPE,
                    serde_json::to_value(&event)?,
                )
                .await?;

                Ok(true)
            })
        })
        .await
    }

    /// PENDING orders past their payment deadline become EXPIRED. Inventory
    /// release is not tied to this pass; the reservation's own expiry returns
    /// the quantity to the pool.
    async fn expire_pending_orders(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let expired = diesel::update(
            flash_sale_orders::table
                .filter(flash_sale_orders::status.eq(OrderStatus::Pending.as_str()))
                .filter(flash_sale_orders::payment_deadline.lt(now)),
        )
        .set((
            flash_sale_orders::status.eq(OrderStatus::Expired.as_str()),
            flash_sale_orders::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(expired)
    }

    /// SCHEDULED sales whose window has opened become ACTIVE; ACTIVE sales
    /// whose window has closed become ENDED. SOLD_OUT needs no sweep: the
    /// orchestrator flips it when availability reaches zero under the lock.
    async fn advance_sale_lifecycle(&self) -> Result<(usize, usize)> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let activated = diesel::update(
            flash_sales::table
                .filter(flash_sales::status.eq(SaleStatus::Scheduled.as_str()))
                .filter(flash_sales::start_time.le(now)),
        )
        .set((
            flash_sales::status.eq(SaleStatus::Active.as_str()),
            flash_sales::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

        let ended = diesel::update(
            flash_sales::table
                .filter(flash_sales::status.eq(SaleStatus::Active.as_str()))
                .filter(flash_sales::end_time.le(now)),
        )
        .set((
            flash_sales::status.eq(SaleStatus::Ended.as_str()),
            flash_sales::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

        Ok((activated, ended))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::{BigDecimal, Zero};
    use chrono::{DateTime, Duration};

    // The sweeps lean entirely on conditional updates settling each row
    // exactly once. These tests pin that contract against an in-memory model
    // of the rows: `try_release` is the expiry pass's per-row transition,
    // `try_convert` the orchestrator's payment conversion.

    struct Hold {
        status: ReservationStatus,
        quantity: BigDecimal,
        expires_at: DateTime<Utc>,
    }

    fn try_release(hold: &mut Hold, reserved: &mut BigDecimal, now: DateTime<Utc>) -> bool {
        if hold.status != ReservationStatus::Active || hold.expires_at >= now {
            return false;
        }
        hold.status = ReservationStatus::Expired;
        *reserved = &*reserved - &hold.quantity;
        true
    }

    fn try_convert(
        hold: &mut Hold,
        reserved: &mut BigDecimal,
        sold: &mut BigDecimal,
    ) -> bool {
        if hold.status != ReservationStatus::Active {
            return false;
        }
        hold.status = ReservationStatus::Converted;
        *reserved = &*reserved - &hold.quantity;
        *sold = &*sold + &hold.quantity;
        true
    }

    fn hold_after(minutes_past_expiry: i64) -> (Hold, DateTime<Utc>) {
        let created = Utc::now();
        let hold = Hold {
            status: ReservationStatus::Active,
            quantity: "2.00".parse().unwrap(),
            expires_at: created + Duration::minutes(15),
        };
        (hold, created + Duration::minutes(15 + minutes_past_expiry))
    }

    #[test]
    fn expiry_releases_the_held_quantity() {
        // 15-minute hold, swept 16 minutes in.
        let (mut hold, now) = hold_after(1);
        let mut reserved: BigDecimal = "2.00".parse().unwrap();

        assert!(try_release(&mut hold, &mut reserved, now));
        assert_eq!(hold.status, ReservationStatus::Expired);
        assert!(reserved.is_zero());
    }

    #[test]
    fn unexpired_holds_are_left_alone() {
        let (mut hold, _) = hold_after(0);
        let mut reserved: BigDecimal = "2.00".parse().unwrap();
        let early = hold.expires_at - Duration::minutes(1);

        assert!(!try_release(&mut hold, &mut reserved, early));
        assert_eq!(hold.status, ReservationStatus::Active);
        assert_eq!(reserved, "2.00".parse::<BigDecimal>().unwrap());
    }

    #[test]
    fn converted_holds_are_never_double_released() {
        let (mut hold, now) = hold_after(1);
        let mut reserved: BigDecimal = "2.00".parse().unwrap();
        let mut sold = BigDecimal::zero();

        // Conversion and expiry race on the same row: exactly one wins.
        assert!(try_convert(&mut hold, &mut reserved, &mut sold));
        assert!(!try_release(&mut hold, &mut reserved, now));

        assert!(reserved.is_zero());
        assert_eq!(sold, "2.00".parse::<BigDecimal>().unwrap());
        assert_eq!(hold.status, ReservationStatus::Converted);
    }

    #[test]
    fn expiry_wins_the_race_instead() {
        let (mut hold, now) = hold_after(1);
        let mut reserved: BigDecimal = "2.00".parse().unwrap();
        let mut sold = BigDecimal::zero();

        assert!(try_release(&mut hold, &mut reserved, now));
        assert!(!try_convert(&mut hold, &mut reserved, &mut sold));

        assert!(reserved.is_zero());
        assert!(sold.is_zero());
        assert_eq!(hold.status, ReservationStatus::Expired);
    }

    #[test]
    fn pending_orders_past_deadline_expire() {
        // The order pass is `WHERE status = 'PENDING' AND deadline < now`.
        let now = Utc::now();
        let transition = |status: OrderStatus, deadline: DateTime<Utc>| -> OrderStatus {
            if status == OrderStatus::Pending && deadline < now {
                OrderStatus::Expired
            } else {
                status
            }
        };

        let past = now - Duration::minutes(1);
        let future = now + Duration::minutes(1);
        assert_eq!(transition(OrderStatus::Pending, past), OrderStatus::Expired);
        assert_eq!(transition(OrderStatus::Pending, future), OrderStatus::Pending);
        assert_eq!(transition(OrderStatus::Paid, past), OrderStatus::Paid);
        assert_eq!(transition(OrderStatus::Expired, past), OrderStatus::Expired);
    }

    #[test]
    fn sweep_is_idempotent() {
        let (mut hold, now) = hold_after(1);
        let mut reserved: BigDecimal = "2.00".parse().unwrap();

        assert!(try_release(&mut hold, &mut reserved, now));
        let after_first = reserved.clone();

        // Immediately running the pass again changes nothing.
        assert!(!try_release(&mut hold, &mut reserved, now));
        assert_eq!(reserved, after_first);
        assert!(reserved.is_zero());
    }
}
