use sea_orm::{EntityTrait, PaginatorTrait, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::{
    dto::orders::OrderList,
    entity::orders::{Column as OrderCol, Entity as Orders},
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::Order,
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    services::order_service::{load_order_lines, order_view},
    state::AppState,
};

/// Cross-user order view. The ledger itself does not authorize; the role
/// check happens here, at the calling boundary.
pub async fn list_all_orders(
    state: &AppState,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = pagination.normalize();

    let finder = Orders::find().order_by_desc(OrderCol::PurchasedOn);
    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let mut items: Vec<Order> = Vec::with_capacity(orders.len());
    for order in orders {
        let lines = load_order_lines(&state.orm, order.id).await?;
        items.push(order_view(order, lines));
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Orders", OrderList { items }, Some(meta)))
}

pub async fn get_order_admin(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let order = Orders::find_by_id(id).one(&state.orm).await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let lines = load_order_lines(&state.orm, order.id).await?;
    Ok(ApiResponse::success(
        "Order found",
        order_view(order, lines),
        Some(Meta::empty()),
    ))
}
