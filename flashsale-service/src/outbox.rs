use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{PurchaseSucceeded, ReservationExpired};

use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Write an event into the outbox, inside the caller's transaction. The
/// relay picks it up after commit, so delivery can never observe a purchase
/// that rolled back.
pub async fn enqueue(
    conn: &mut AsyncPgConnection,
    aggregate_id: Uuid,
    event_type: &str,
    event_data: serde_json::Value,
) -> Result<(), diesel::result::Error> {
    let event = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_id,
        event_type: event_type.to_string(),
        event_data,
    };
    diesel::insert_into(outbox_events::table)
        .values(&event)
        .execute(conn)
        .await?;
    Ok(())
}

fn topic_for(event_type: &str) -> &'static str {
    match event_type {
        PurchaseSucceeded::EVENT_TYPE => "flash-sale-purchases",
        ReservationExpired::EVENT_TYPE => "flash-sale-reservations",
        _ => "domain-events",
    }
}

/// Exponential backoff between delivery attempts: 5s, 10s, 20s, ... capped
/// at five minutes.
fn backoff_delay(attempts: i32) -> ChronoDuration {
    let exponent = (attempts - 1).clamp(0, 6) as u32;
    ChronoDuration::seconds((5 * 2i64.pow(exponent)).min(300))
}

/// Polls the outbox and publishes committed events to Kafka. At-least-once:
/// a row is only marked processed after the broker acknowledged it, and a
/// row that keeps failing moves to the dead-letter table for manual
/// inspection once its attempt budget is spent.
pub struct OutboxRelay {
    pool: DbPool,
    producer: FutureProducer,
    max_attempts: i32,
}

impl OutboxRelay {
    pub fn new(pool: DbPool, producer: FutureProducer, max_attempts: i32) -> Self {
        Self {
            pool,
            producer,
            max_attempts,
        }
    }

    pub async fn run(&self, period: Duration) {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = self.process_due_events().await {
                error!("outbox relay pass failed: {}", e);
            }
        }
    }

    async fn process_due_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let due: Vec<OutboxEvent> = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .filter(outbox_events::next_attempt_at.le(now))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .load(&mut conn)
            .await?;

        for event in due {
            match self.publish(&event).await {
                Ok(()) => {
                    diesel::update(outbox_events::table.find(event.id))
                        .set(outbox_events::processed.eq(true))
                        .execute(&mut conn)
                        .await?;
                    info!("published outbox event {} ({})", event.id, event.event_type);
                }
                Err(e) => {
                    self.record_failure(&mut conn, &event, &e.to_string())
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let topic = topic_for(&event.event_type);
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to publish event: {}", e))?;

        Ok(())
    }

    async fn record_failure(
        &self,
        conn: &mut AsyncPgConnection,
        event: &OutboxEvent,
        last_error: &str,
    ) -> Result<()> {
        let attempts = event.attempts + 1;

        if attempts >= self.max_attempts {
            let dead_letter = NewDeadLetter {
                id: event.id,
                aggregate_id: event.aggregate_id,
                event_type: event.event_type.clone(),
                event_data: event.event_data.clone(),
                attempts,
                last_error: Some(last_error.to_string()),
            };
            let event_id = event.id;
            conn.transaction::<(), anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    diesel::insert_into(outbox_dead_letters::table)
                        .values(&dead_letter)
                        .execute(conn)
                        .await?;
                    diesel::delete(outbox_events::table.find(event_id))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
            error!(
                "outbox event {} moved to dead letters after {} attempts: {}",
                event.id, attempts, last_error
            );
        } else {
            let next_attempt_at = Utc::now() + backoff_delay(attempts);
            diesel::update(outbox_events::table.find(event.id))
                .set((
                    outbox_events::attempts.eq(attempts),
                    outbox_events::last_error.eq(Some(last_error.to_string())),
                    outbox_events::next_attempt_at.eq(next_attempt_at),
                ))
                .execute(conn)
                .await?;
            warn!(
                "outbox event {} delivery failed (attempt {}/{}), retrying at {}: {}",
                event.id, attempts, self.max_attempts, next_attempt_at, last_error
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_route_to_their_topics() {
        assert_eq!(topic_for(PurchaseSucceeded::EVENT_TYPE), "flash-sale-purchases");
        assert_eq!(
            topic_for(ReservationExpired::EVENT_TYPE),
            "flash-sale-reservations"
        );
        assert_eq!(topic_for("SomethingElse"), "domain-events");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), ChronoDuration::seconds(5));
        assert_eq!(backoff_delay(2), ChronoDuration::seconds(10));
        assert_eq!(backoff_delay(3), ChronoDuration::seconds(20));
        assert_eq!(backoff_delay(6), ChronoDuration::seconds(160));
        assert_eq!(backoff_delay(7), ChronoDuration::seconds(300));
        assert_eq!(backoff_delay(50), ChronoDuration::seconds(300));
    }
}
