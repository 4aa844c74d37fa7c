use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::*;
use crate::schema::*;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSaleRequest {
    pub product_id: Uuid,
    pub product_name: String,
    pub name: String,
    pub description: Option<String>,
    pub original_price: BigDecimal,
    pub flash_price: BigDecimal,
    pub total_quantity: BigDecimal,
    pub max_per_user: Option<BigDecimal>,
    pub min_purchase: Option<BigDecimal>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub priority: Option<i32>,
    pub is_featured: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSaleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub flash_price: Option<BigDecimal>,
    pub total_quantity: Option<BigDecimal>,
    pub max_per_user: Option<BigDecimal>,
    pub min_purchase: Option<BigDecimal>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub is_featured: Option<bool>,
}

#[derive(AsChangeset)]
#[diesel(table_name = crate::schema::flash_sales)]
struct SaleChanges {
    name: Option<String>,
    description: Option<String>,
    flash_price: Option<BigDecimal>,
    total_quantity: Option<BigDecimal>,
    max_per_user: Option<BigDecimal>,
    min_purchase: Option<BigDecimal>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    priority: Option<i32>,
    is_featured: Option<bool>,
    updated_at: DateTime<Utc>,
}

fn validate_create(req: &CreateSaleRequest) -> Result<(), ServiceError> {
    if req.start_time >= req.end_time {
        return Err(ServiceError::Validation(
            "end time must be after start time".into(),
        ));
    }
    if req.flash_price >= req.original_price {
        return Err(ServiceError::Validation(
            "flash price must be below the original price".into(),
        ));
    }
    if req.total_quantity <= BigDecimal::zero() {
        return Err(ServiceError::Validation(
            "total quantity must be positive".into(),
        ));
    }
    Ok(())
}

pub async fn create_sale(
    conn: &mut AsyncPgConnection,
    req: CreateSaleRequest,
) -> Result<FlashSale, ServiceError> {
    validate_create(&req)?;

    let new_sale = NewFlashSale {
        id: Uuid::new_v4(),
        product_id: req.product_id,
        product_name: req.product_name,
        name: req.name,
        description: req.description,
        original_price: req.original_price,
        flash_price: req.flash_price,
        total_quantity: req.total_quantity,
        sold_quantity: BigDecimal::zero(),
        reserved_quantity: BigDecimal::zero(),
        max_per_user: req.max_per_user.unwrap_or_else(|| BigDecimal::from(5)),
        min_purchase: req
            .min_purchase
            .unwrap_or_else(|| "0.5".parse().expect("static decimal")),
        start_time: req.start_time,
        end_time: req.end_time,
        status: SaleStatus::Scheduled.as_str().to_string(),
        priority: req.priority.unwrap_or(0),
        is_featured: req.is_featured.unwrap_or(false),
    };

    let sale: FlashSale = diesel::insert_into(flash_sales::table)
        .values(&new_sale)
        .get_result(conn)
        .await?;
    info!("created flash sale: id={} name={}", sale.id, sale.name);
    Ok(sale)
}

/// Updates refuse terminal sales and never shrink `total_quantity` below
/// what is already sold. `start_time` can only move while still SCHEDULED.
pub async fn update_sale(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    mut req: UpdateSaleRequest,
) -> Result<FlashSale, ServiceError> {
    let sale: FlashSale = flash_sales::table
        .find(id)
        .first(conn)
        .await
        .optional()?
        .ok_or(ServiceError::NotFound("flash sale"))?;

    if matches!(
        sale.status(),
        SaleStatus::Ended | SaleStatus::Cancelled | SaleStatus::SoldOut
    ) {
        return Err(ServiceError::Validation(
            "cannot update a finished flash sale".into(),
        ));
    }
    if let Some(total) = &req.total_quantity {
        if total < &sale.sold_quantity {
            return Err(ServiceError::Validation(
                "total quantity cannot drop below the sold quantity".into(),
            ));
        }
    }
    if sale.status() != SaleStatus::Scheduled {
        req.start_time = None;
    }

    let changes = SaleChanges {
        name: req.name,
        description: req.description,
        flash_price: req.flash_price,
        total_quantity: req.total_quantity,
        max_per_user: req.max_per_user,
        min_purchase: req.min_purchase,
        start_time: req.start_time,
        end_time: req.end_time,
        priority: req.priority,
        is_featured: req.is_featured,
        updated_at: Utc::now(),
    };

    let sale: FlashSale = diesel::update(flash_sales::table.find(id))
        .set(&changes)
        .get_result(conn)
        .await?;
    info!("updated flash sale: id={}", sale.id);
    Ok(sale)
}

pub async fn cancel_sale(
    conn: &mut AsyncPgConnection,
    id: Uuid,
) -> Result<FlashSale, ServiceError> {
    let sale: FlashSale = flash_sales::table
        .find(id)
        .first(conn)
        .await
        .optional()?
        .ok_or(ServiceError::NotFound("flash sale"))?;

    if sale.status().is_final() {
        return Err(ServiceError::Validation(
            "flash sale has already ended or been cancelled".into(),
        ));
    }

    let sale: FlashSale = diesel::update(flash_sales::table.find(id))
        .set((
            flash_sales::status.eq(SaleStatus::Cancelled.as_str()),
            flash_sales::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
        .await?;
    info!("cancelled flash sale: id={}", sale.id);
    Ok(sale)
}

pub async fn get_sale(conn: &mut AsyncPgConnection, id: Uuid) -> Result<FlashSale, ServiceError> {
    flash_sales::table
        .find(id)
        .first(conn)
        .await
        .optional()?
        .ok_or(ServiceError::NotFound("flash sale"))
}

pub async fn list_active(
    conn: &mut AsyncPgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<FlashSale>, ServiceError> {
    let sales = flash_sales::table
        .filter(flash_sales::status.eq(SaleStatus::Active.as_str()))
        .filter(flash_sales::start_time.le(now))
        .filter(flash_sales::end_time.gt(now))
        .order((flash_sales::priority.desc(), flash_sales::end_time.asc()))
        .load(conn)
        .await?;
    Ok(sales)
}

pub async fn list_upcoming(
    conn: &mut AsyncPgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<FlashSale>, ServiceError> {
    let sales = flash_sales::table
        .filter(flash_sales::status.eq(SaleStatus::Scheduled.as_str()))
        .filter(flash_sales::start_time.gt(now))
        .order(flash_sales::start_time.asc())
        .load(conn)
        .await?;
    Ok(sales)
}

pub async fn list_featured(
    conn: &mut AsyncPgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<FlashSale>, ServiceError> {
    let sales = flash_sales::table
        .filter(flash_sales::status.eq(SaleStatus::Active.as_str()))
        .filter(flash_sales::is_featured.eq(true))
        .filter(flash_sales::start_time.le(now))
        .filter(flash_sales::end_time.gt(now))
        .order((flash_sales::priority.desc(), flash_sales::end_time.asc()))
        .load(conn)
        .await?;
    Ok(sales)
}

pub async fn list_by_status(
    conn: &mut AsyncPgConnection,
    statuses: Option<Vec<SaleStatus>>,
    limit: i64,
    offset: i64,
) -> Result<Vec<FlashSale>, ServiceError> {
    let mut query = flash_sales::table.into_boxed();
    if let Some(statuses) = statuses {
        let names: Vec<&'static str> = statuses.iter().map(SaleStatus::as_str).collect();
        query = query.filter(flash_sales::status.eq_any(names));
    }
    let sales = query
        .order(flash_sales::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load(conn)
        .await?;
    Ok(sales)
}

pub async fn orders_for_sale(
    conn: &mut AsyncPgConnection,
    sale_id: Uuid,
    customer_id: Uuid,
) -> Result<Vec<FlashSaleOrder>, ServiceError> {
    let orders = flash_sale_orders::table
        .filter(flash_sale_orders::sale_id.eq(sale_id))
        .filter(flash_sale_orders::customer_id.eq(customer_id))
        .order(flash_sale_orders::created_at.desc())
        .load(conn)
        .await?;
    Ok(orders)
}

pub async fn orders_for_customer(
    conn: &mut AsyncPgConnection,
    customer_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<FlashSaleOrder>, ServiceError> {
    let orders = flash_sale_orders::table
        .filter(flash_sale_orders::customer_id.eq(customer_id))
        .order(flash_sale_orders::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load(conn)
        .await?;
    Ok(orders)
}

pub async fn order_detail(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    customer_id: Uuid,
) -> Result<FlashSaleOrder, ServiceError> {
    flash_sale_orders::table
        .find(order_id)
        .filter(flash_sale_orders::customer_id.eq(customer_id))
        .first(conn)
        .await
        .optional()?
        .ok_or(ServiceError::NotFound("order"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request() -> CreateSaleRequest {
        let now = Utc::now();
        CreateSaleRequest {
            product_id: Uuid::new_v4(),
            product_name: "Linen".into(),
            name: "Linen flash".into(),
            description: None,
            original_price: "200.00".parse().unwrap(),
            flash_price: "150.00".parse().unwrap(),
            total_quantity: "10.00".parse().unwrap(),
            max_per_user: None,
            min_purchase: None,
            start_time: now + Duration::hours(1),
            end_time: now + Duration::hours(2),
            priority: None,
            is_featured: None,
        }
    }

    #[test]
    fn create_requires_forward_window() {
        let mut req = request();
        req.end_time = req.start_time - Duration::minutes(1);
        assert!(matches!(
            validate_create(&req),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn create_requires_a_real_discount() {
        let mut req = request();
        req.flash_price = req.original_price.clone();
        assert!(matches!(
            validate_create(&req),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn create_requires_positive_stock() {
        let mut req = request();
        req.total_quantity = "0.00".parse().unwrap();
        assert!(matches!(
            validate_create(&req),
            Err(ServiceError::Validation(_))
        ));
        assert!(validate_create(&request()).is_ok());
    }
}
