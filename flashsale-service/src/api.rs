use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::error::{PurchaseRejection, ServiceError};
use crate::models::*;
use crate::purchase::{self, EngineConfig, PurchaseOutcome, PurchaseSuccess, ShippingInfo};
use crate::sales;

type DbPool = Pool<AsyncPgConnection>;
type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: EngineConfig,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sales", get(list_active_sales))
        .route("/sales/upcoming", get(list_upcoming_sales))
        .route("/sales/featured", get(list_featured_sales))
        .route("/sales/:id", get(sale_detail))
        .route("/sales/:id/purchase", post(purchase_sale))
        .route("/sales/:id/orders", get(my_orders_for_sale))
        .route("/orders", get(my_orders))
        .route("/orders/:id", get(order_detail))
        .route("/orders/:id/pay", post(pay_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/admin/sales", post(create_sale).get(list_sales_admin))
        .route("/admin/sales/:id", put(update_sale))
        .route("/admin/sales/:id/cancel", post(cancel_sale))
        .route("/admin/orders/:id/refund", post(refund_order))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn map_service_error(e: ServiceError) -> ApiError {
    match e {
        ServiceError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("{what} not found"),
            }),
        ),
        ServiceError::Validation(message) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
        }
        ServiceError::LockTimeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "the sale is busy, please retry".into(),
            }),
        ),
        other => {
            error!("request failed: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal error".into(),
                }),
            )
        }
    }
}

/// The caller is already authenticated upstream; an opaque customer id
/// arrives in a header.
fn customer_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    optional_customer_id(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "missing or invalid x-customer-id header".into(),
        }),
    ))
}

fn optional_customer_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("x-customer-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

async fn connection(state: &AppState) -> Result<
    diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>,
    ApiError,
> {
    state
        .pool
        .get()
        .await
        .map_err(|e| map_service_error(e.into()))
}

#[derive(Debug, Serialize)]
pub struct SaleResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub name: String,
    pub description: Option<String>,
    pub original_price: BigDecimal,
    pub flash_price: BigDecimal,
    pub discount_percent: i32,
    pub total_quantity: BigDecimal,
    pub sold_quantity: BigDecimal,
    pub reserved_quantity: BigDecimal,
    pub available_quantity: BigDecimal,
    pub sold_percentage: i32,
    pub max_per_user: BigDecimal,
    pub min_purchase: BigDecimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub remaining_seconds: Option<i64>,
    pub status: String,
    pub priority: i32,
    pub is_featured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_purchased: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_remaining_limit: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SaleResponse {
    fn from_sale(sale: FlashSale, now: DateTime<Utc>, user_purchased: Option<BigDecimal>) -> Self {
        let user_remaining_limit = user_purchased
            .as_ref()
            .map(|purchased| &sale.max_per_user - purchased);
        SaleResponse {
            discount_percent: sale.discount_percent(),
            available_quantity: sale.available_quantity(),
            sold_percentage: sale.sold_percentage(),
            remaining_seconds: sale.remaining_seconds(now),
            user_purchased,
            user_remaining_limit,
            id: sale.id,
            product_id: sale.product_id,
            product_name: sale.product_name,
            name: sale.name,
            description: sale.description,
            original_price: sale.original_price,
            flash_price: sale.flash_price,
            total_quantity: sale.total_quantity,
            sold_quantity: sale.sold_quantity,
            reserved_quantity: sale.reserved_quantity,
            max_per_user: sale.max_per_user,
            min_purchase: sale.min_purchase,
            start_time: sale.start_time,
            end_time: sale.end_time,
            status: sale.status,
            priority: sale.priority,
            is_featured: sale.is_featured,
            created_at: sale.created_at,
            updated_at: sale.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: FlashSaleOrder,
    pub payment_remaining_seconds: i64,
}

impl OrderResponse {
    fn from_order(order: FlashSaleOrder) -> Self {
        let payment_remaining_seconds = order.payment_remaining_seconds(Utc::now());
        OrderResponse {
            order,
            payment_remaining_seconds,
        }
    }
}

async fn list_active_sales(
    State(state): State<AppState>,
) -> Result<Json<Vec<SaleResponse>>, ApiError> {
    let mut conn = connection(&state).await?;
    let now = Utc::now();
    let sales = sales::list_active(&mut conn, now)
        .await
        .map_err(map_service_error)?;
    Ok(Json(
        sales
            .into_iter()
            .map(|s| SaleResponse::from_sale(s, now, None))
            .collect(),
    ))
}

async fn list_upcoming_sales(
    State(state): State<AppState>,
) -> Result<Json<Vec<SaleResponse>>, ApiError> {
    let mut conn = connection(&state).await?;
    let now = Utc::now();
    let sales = sales::list_upcoming(&mut conn, now)
        .await
        .map_err(map_service_error)?;
    Ok(Json(
        sales
            .into_iter()
            .map(|s| SaleResponse::from_sale(s, now, None))
            .collect(),
    ))
}

async fn list_featured_sales(
    State(state): State<AppState>,
) -> Result<Json<Vec<SaleResponse>>, ApiError> {
    let mut conn = connection(&state).await?;
    let now = Utc::now();
    let sales = sales::list_featured(&mut conn, now)
        .await
        .map_err(map_service_error)?;
    Ok(Json(
        sales
            .into_iter()
            .map(|s| SaleResponse::from_sale(s, now, None))
            .collect(),
    ))
}

async fn sale_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SaleResponse>, ApiError> {
    let mut conn = connection(&state).await?;
    let now = Utc::now();
    let sale = sales::get_sale(&mut conn, id)
        .await
        .map_err(map_service_error)?;

    let user_purchased = match optional_customer_id(&headers) {
        Some(customer) => Some(
            purchase::committed_quantity(&mut conn, id, customer)
                .await
                .map_err(map_service_error)?,
        ),
        None => None,
    };

    Ok(Json(SaleResponse::from_sale(sale, now, user_purchased)))
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub quantity: BigDecimal,
    #[serde(flatten)]
    pub shipping: ShippingInfo,
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponseBody {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub result: Option<Box<PurchaseSuccess>>,
    #[serde(flatten)]
    pub rejection: Option<PurchaseRejection>,
}

async fn purchase_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResponseBody>, ApiError> {
    let customer = customer_id(&headers)?;

    let outcome = purchase::purchase(
        &state.pool,
        &state.config,
        sale_id,
        customer,
        request.quantity,
        request.shipping,
    )
    .await
    .map_err(map_service_error)?;

    let body = match outcome {
        PurchaseOutcome::Success(result) => PurchaseResponseBody {
            success: true,
            message: format!(
                "order placed, pay within {} minutes",
                state.config.payment_window.num_minutes()
            ),
            result: Some(result),
            rejection: None,
        },
        PurchaseOutcome::Rejected(rejection) => PurchaseResponseBody {
            success: false,
            message: rejection.to_string(),
            result: None,
            rejection: Some(rejection),
        },
    };
    Ok(Json(body))
}

async fn my_orders_for_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    let customer = customer_id(&headers)?;
    let mut conn = connection(&state).await?;
    let orders = sales::orders_for_sale(&mut conn, sale_id, customer)
        .await
        .map_err(map_service_error)?;
    Ok(Json(orders.into_iter().map(OrderResponse::from_order).collect()))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

async fn my_orders(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    let customer = customer_id(&headers)?;
    let mut conn = connection(&state).await?;
    let orders = sales::orders_for_customer(&mut conn, customer, page.limit(), page.offset())
        .await
        .map_err(map_service_error)?;
    Ok(Json(orders.into_iter().map(OrderResponse::from_order).collect()))
}

async fn order_detail(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<OrderResponse>, ApiError> {
    let customer = customer_id(&headers)?;
    let mut conn = connection(&state).await?;
    let order = sales::order_detail(&mut conn, order_id, customer)
        .await
        .map_err(map_service_error)?;
    Ok(Json(OrderResponse::from_order(order)))
}

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub payment_method: String,
}

async fn pay_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<PayRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let customer = customer_id(&headers)?;
    let order = purchase::confirm_payment(
        &state.pool,
        &state.config,
        order_id,
        customer,
        request.payment_method,
    )
    .await
    .map_err(map_service_error)?;
    Ok(Json(OrderResponse::from_order(order)))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<OrderResponse>, ApiError> {
    let customer = customer_id(&headers)?;
    let order = purchase::cancel_order(&state.pool, &state.config, order_id, customer)
        .await
        .map_err(map_service_error)?;
    Ok(Json(OrderResponse::from_order(order)))
}

async fn create_sale(
    State(state): State<AppState>,
    Json(request): Json<sales::CreateSaleRequest>,
) -> Result<Json<SaleResponse>, ApiError> {
    let mut conn = connection(&state).await?;
    let sale = sales::create_sale(&mut conn, request)
        .await
        .map_err(map_service_error)?;
    Ok(Json(SaleResponse::from_sale(sale, Utc::now(), None)))
}

async fn update_sale(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<sales::UpdateSaleRequest>,
) -> Result<Json<SaleResponse>, ApiError> {
    let mut conn = connection(&state).await?;
    let sale = sales::update_sale(&mut conn, id, request)
        .await
        .map_err(map_service_error)?;
    Ok(Json(SaleResponse::from_sale(sale, Utc::now(), None)))
}

async fn cancel_sale(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SaleResponse>, ApiError> {
    let mut conn = connection(&state).await?;
    let sale = sales::cancel_sale(&mut conn, id)
        .await
        .map_err(map_service_error)?;
    Ok(Json(SaleResponse::from_sale(sale, Utc::now(), None)))
}

#[derive(Debug, Deserialize)]
pub struct AdminListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

async fn list_sales_admin(
    State(state): State<AppState>,
    Query(params): Query<AdminListParams>,
) -> Result<Json<Vec<SaleResponse>>, ApiError> {
    let statuses = match &params.status {
        Some(raw) => {
            let mut parsed = Vec::new();
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let status = SaleStatus::parse(name).ok_or((
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: format!("unknown status: {name}"),
                    }),
                ))?;
                parsed.push(status);
            }
            Some(parsed)
        }
        None => None,
    };
    let page = PageParams {
        limit: params.limit,
        offset: params.offset,
    };

    let mut conn = connection(&state).await?;
    let now = Utc::now();
    let sales = sales::list_by_status(&mut conn, statuses, page.limit(), page.offset())
        .await
        .map_err(map_service_error)?;
    Ok(Json(
        sales
            .into_iter()
            .map(|s| SaleResponse::from_sale(s, now, None))
            .collect(),
    ))
}

async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = purchase::refund_order(&state.pool, order_id)
        .await
        .map_err(map_service_error)?;
    Ok(Json(OrderResponse::from_order(order)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_params_clamp() {
        let page = PageParams {
            limit: Some(1000),
            offset: Some(-5),
        };
        assert_eq!(page.limit(), 100);
        assert_eq!(page.offset(), 0);

        let page = PageParams {
            limit: None,
            offset: None,
        };
        assert_eq!(page.limit(), 20);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn customer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        assert!(optional_customer_id(&headers).is_none());

        headers.insert("x-customer-id", "not-a-uuid".parse().unwrap());
        assert!(optional_customer_id(&headers).is_none());

        let id = Uuid::new_v4();
        headers.insert("x-customer-id", id.to_string().parse().unwrap());
        assert_eq!(optional_customer_id(&headers), Some(id));
    }
}
