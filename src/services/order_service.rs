use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::OrderList,
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::{Column as CartCol, Entity as Carts},
        order_items::{self, Column as OrderItemCol, Entity as OrderItems},
        orders::{self, Column as OrderCol, Entity as Orders},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderLine},
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    services::cart_service::{MAX_CAS_RETRIES, claim_cart, load_items},
    state::AppState,
};

/// The single cart → order transition. The order insert and the cart clear
/// share one transaction, guarded by the same version claim as every other
/// cart mutation, so a racing add lands either entirely before or entirely
/// after the snapshot.
pub async fn checkout(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<Order>> {
    for _ in 0..MAX_CAS_RETRIES {
        let txn = state.orm.begin().await?;

        let Some(cart) = Carts::find_by_id(user.user_id).one(&txn).await? else {
            return Err(AppError::EmptyCart);
        };
        let items = load_items(&txn, user.user_id).await?;
        if items.is_empty() {
            return Err(AppError::EmptyCart);
        }

        // An earlier attempt may have recorded the order for this cart
        // generation without clearing the cart. Finish that checkout: clear
        // the items and hand back the order that already exists.
        let existing = Orders::find()
            .filter(OrderCol::UserId.eq(user.user_id))
            .filter(OrderCol::CartVersion.eq(cart.version))
            .one(&txn)
            .await?;
        if let Some(order) = existing {
            if !claim_cart(&txn, user.user_id, cart.version).await? {
                txn.rollback().await?;
                continue;
            }
            clear_items(&txn, user.user_id).await?;
            txn.commit().await?;

            let lines = load_order_lines(&state.orm, order.id).await?;
            return Ok(ApiResponse::success(
                "Checkout complete",
                order_view(order, lines),
                Some(Meta::empty()),
            ));
        }

        if !claim_cart(&txn, user.user_id, cart.version).await? {
            txn.rollback().await?;
            continue;
        }

        // The total is copied from the cart, which maintains it atomically
        // with the items; it is not recomputed here or later.
        let order = orders::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user.user_id),
            total_price: Set(cart.total_price),
            cart_version: Set(cart.version),
            purchased_on: Set(Utc::now().into()),
        }
        .insert(&txn)
        .await
        .map_err(|err| match err.sql_err() {
            // A concurrent checkout already consumed this cart generation.
            Some(SqlErr::UniqueConstraintViolation(_)) => AppError::ConcurrencyConflict,
            _ => err.into(),
        })?;

        let mut lines = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let line = order_items::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(item.product_id),
                product_name: Set(item.product_name.clone()),
                quantity: Set(item.quantity),
                line_no: Set(idx as i32),
            }
            .insert(&txn)
            .await?;
            lines.push(line);
        }

        clear_items(&txn, user.user_id).await?;
        txn.commit().await?;

        if let Err(err) = log_audit(
            &state.orm,
            Some(user.user_id),
            "checkout",
            Some("orders"),
            Some(serde_json::json!({ "order_id": order.id, "total_price": order.total_price })),
        )
        .await
        {
            tracing::warn!(error = %err, "audit log failed");
        }

        return Ok(ApiResponse::success(
            "Checkout complete",
            order_view(order, lines),
            Some(Meta::empty()),
        ));
    }

    Err(AppError::ConcurrencyConflict)
}

/// The caller's own orders, newest first.
pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = pagination.normalize();
    let finder = Orders::find()
        .filter(OrderCol::UserId.eq(user.user_id))
        .order_by_desc(OrderCol::PurchasedOn);

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let mut items = Vec::with_capacity(orders.len());
    for order in orders {
        let lines = load_order_lines(&state.orm, order.id).await?;
        items.push(order_view(order, lines));
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Orders", OrderList { items }, Some(meta)))
}

pub async fn get_order(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<ApiResponse<Order>> {
    let order = Orders::find()
        .filter(OrderCol::UserId.eq(user.user_id))
        .filter(OrderCol::Id.eq(id))
        .one(&state.orm)
        .await?;
    let Some(order) = order else {
        return Err(AppError::NotFound);
    };

    let lines = load_order_lines(&state.orm, order.id).await?;
    Ok(ApiResponse::success(
        "OK",
        order_view(order, lines),
        Some(Meta::empty()),
    ))
}

async fn clear_items<C: ConnectionTrait>(conn: &C, user_id: Uuid) -> AppResult<()> {
    CartItems::delete_many()
        .filter(CartItemCol::UserId.eq(user_id))
        .exec(conn)
        .await?;
    Carts::update_many()
        .col_expr(CartCol::TotalPrice, Expr::value(0_i64))
        .col_expr(CartCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(CartCol::UserId.eq(user_id))
        .exec(conn)
        .await?;
    Ok(())
}

pub(crate) async fn load_order_lines<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> AppResult<Vec<order_items::Model>> {
    Ok(OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order_id))
        .order_by_asc(OrderItemCol::LineNo)
        .all(conn)
        .await?)
}

pub(crate) fn order_view(model: orders::Model, lines: Vec<order_items::Model>) -> Order {
    Order {
        id: model.id,
        user_id: model.user_id,
        products_ordered: lines
            .into_iter()
            .map(|line| OrderLine {
                product_id: line.product_id,
                product_name: line.product_name,
                quantity: line.quantity,
            })
            .collect(),
        total_price: model.total_price,
        purchased_on: model.purchased_on.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_model(total: i64) -> orders::Model {
        orders::Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            total_price: total,
            cart_version: 1,
            purchased_on: Utc::now().into(),
        }
    }

    fn line_model(order_id: Uuid, name: &str, quantity: i32, line_no: i32) -> order_items::Model {
        order_items::Model {
            id: Uuid::new_v4(),
            order_id,
            product_id: Uuid::new_v4(),
            product_name: name.into(),
            quantity,
            line_no,
        }
    }

    #[test]
    fn view_copies_quantity_and_name_per_line() {
        let order = order_model(250);
        let lines = vec![
            line_model(order.id, "widget", 2, 0),
            line_model(order.id, "gadget", 1, 1),
        ];
        let view = order_view(order, lines);
        assert_eq!(view.total_price, 250);
        assert_eq!(view.products_ordered.len(), 2);
        assert_eq!(view.products_ordered[0].product_name, "widget");
        assert_eq!(view.products_ordered[0].quantity, 2);
        assert_eq!(view.products_ordered[1].quantity, 1);
    }
}
