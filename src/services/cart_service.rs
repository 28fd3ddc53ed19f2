use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    SqlErr, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::cart::{AddToCartRequest, Cart, UpdateQuantityRequest},
    entity::{
        cart_items::{self, Column as CartItemCol, Entity as CartItems},
        carts::{self, Column as CartCol, Entity as Carts},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{CartLine, cart_total, line_subtotal},
    response::ApiResponse,
    services::product_service,
    state::AppState,
};

/// Bounded internal retries for the version compare-and-swap. Exhaustion
/// surfaces as `ConcurrencyConflict` instead of silently dropping the
/// caller's intent.
pub(crate) const MAX_CAS_RETRIES: u32 = 3;

pub async fn get_cart(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<Cart>> {
    // Reads never create the cart row; a user without one simply has an
    // empty cart.
    let items = load_items(&state.orm, user.user_id).await?;
    Ok(ApiResponse::success(
        "OK",
        cart_view(user.user_id, items),
        None,
    ))
}

pub async fn add_to_cart(
    state: &AppState,
    user: &AuthUser,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<Cart>> {
    if payload.quantity < 1 {
        return Err(AppError::InvalidQuantity);
    }

    for _ in 0..MAX_CAS_RETRIES {
        let txn = state.orm.begin().await?;
        let cart = match load_or_create_cart(&txn, user.user_id).await {
            Ok(cart) => cart,
            Err(AppError::ConcurrencyConflict) => {
                txn.rollback().await?;
                continue;
            }
            Err(err) => return Err(err),
        };
        if !claim_cart(&txn, user.user_id, cart.version).await? {
            txn.rollback().await?;
            continue;
        }

        // Re-snapshot name and price from the catalog on every add; the line
        // keeps whatever the catalog said at the time of the last add.
        let snapshot = product_service::catalog_snapshot(&txn, payload.product_id).await?;

        let now = Utc::now();
        let existing = CartItems::find()
            .filter(CartItemCol::UserId.eq(user.user_id))
            .filter(CartItemCol::ProductId.eq(payload.product_id))
            .one(&txn)
            .await?;

        match existing {
            Some(line) => {
                let quantity = line.quantity + payload.quantity;
                let mut active: cart_items::ActiveModel = line.into();
                active.quantity = Set(quantity);
                active.product_name = Set(snapshot.name);
                active.unit_price = Set(snapshot.price);
                active.updated_at = Set(now.into());
                active.update(&txn).await?;
            }
            None => {
                cart_items::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user.user_id),
                    product_id: Set(payload.product_id),
                    product_name: Set(snapshot.name),
                    unit_price: Set(snapshot.price),
                    quantity: Set(payload.quantity),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                }
                .insert(&txn)
                .await?;
            }
        }

        let cart = store_total(&txn, user.user_id).await?;
        txn.commit().await?;

        if let Err(err) = log_audit(
            &state.orm,
            Some(user.user_id),
            "cart_add",
            Some("cart_items"),
            Some(
                serde_json::json!({ "product_id": payload.product_id, "quantity": payload.quantity }),
            ),
        )
        .await
        {
            tracing::warn!(error = %err, "audit log failed");
        }

        return Ok(ApiResponse::success("Added to cart", cart, None));
    }

    Err(AppError::ConcurrencyConflict)
}

pub async fn update_quantity(
    state: &AppState,
    user: &AuthUser,
    payload: UpdateQuantityRequest,
) -> AppResult<ApiResponse<Cart>> {
    // A low value never removes the line; removal is its own operation.
    if payload.new_quantity < 1 {
        return Err(AppError::InvalidQuantity);
    }

    for _ in 0..MAX_CAS_RETRIES {
        let txn = state.orm.begin().await?;
        let Some(cart) = Carts::find_by_id(user.user_id).one(&txn).await? else {
            return Err(AppError::LineNotFound);
        };
        if !claim_cart(&txn, user.user_id, cart.version).await? {
            txn.rollback().await?;
            continue;
        }

        let line = CartItems::find()
            .filter(CartItemCol::UserId.eq(user.user_id))
            .filter(CartItemCol::ProductId.eq(payload.product_id))
            .one(&txn)
            .await?;
        let Some(line) = line else {
            return Err(AppError::LineNotFound);
        };

        let mut active: cart_items::ActiveModel = line.into();
        active.quantity = Set(payload.new_quantity);
        active.updated_at = Set(Utc::now().into());
        active.update(&txn).await?;

        let cart = store_total(&txn, user.user_id).await?;
        txn.commit().await?;

        if let Err(err) = log_audit(
            &state.orm,
            Some(user.user_id),
            "cart_update_quantity",
            Some("cart_items"),
            Some(
                serde_json::json!({ "product_id": payload.product_id, "quantity": payload.new_quantity }),
            ),
        )
        .await
        {
            tracing::warn!(error = %err, "audit log failed");
        }

        return Ok(ApiResponse::success("Quantity updated", cart, None));
    }

    Err(AppError::ConcurrencyConflict)
}

pub async fn remove_from_cart(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
) -> AppResult<ApiResponse<Cart>> {
    for _ in 0..MAX_CAS_RETRIES {
        let txn = state.orm.begin().await?;
        let Some(cart) = Carts::find_by_id(user.user_id).one(&txn).await? else {
            return Ok(ApiResponse::success(
                "Removed from cart",
                cart_view(user.user_id, Vec::new()),
                None,
            ));
        };

        // Removing an absent line is a no-op, not an error; leave the cart
        // version untouched.
        let present = CartItems::find()
            .filter(CartItemCol::UserId.eq(user.user_id))
            .filter(CartItemCol::ProductId.eq(product_id))
            .one(&txn)
            .await?
            .is_some();
        if !present {
            let items = load_items(&txn, user.user_id).await?;
            txn.rollback().await?;
            return Ok(ApiResponse::success(
                "Removed from cart",
                cart_view(user.user_id, items),
                None,
            ));
        }

        if !claim_cart(&txn, user.user_id, cart.version).await? {
            txn.rollback().await?;
            continue;
        }

        CartItems::delete_many()
            .filter(CartItemCol::UserId.eq(user.user_id))
            .filter(CartItemCol::ProductId.eq(product_id))
            .exec(&txn)
            .await?;

        let cart = store_total(&txn, user.user_id).await?;
        txn.commit().await?;

        if let Err(err) = log_audit(
            &state.orm,
            Some(user.user_id),
            "cart_remove",
            Some("cart_items"),
            Some(serde_json::json!({ "product_id": product_id })),
        )
        .await
        {
            tracing::warn!(error = %err, "audit log failed");
        }

        return Ok(ApiResponse::success("Removed from cart", cart, None));
    }

    Err(AppError::ConcurrencyConflict)
}

pub async fn clear_cart(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<Cart>> {
    for _ in 0..MAX_CAS_RETRIES {
        let txn = state.orm.begin().await?;
        let Some(cart) = Carts::find_by_id(user.user_id).one(&txn).await? else {
            return Ok(ApiResponse::success(
                "Cart cleared",
                cart_view(user.user_id, Vec::new()),
                None,
            ));
        };

        let items = load_items(&txn, user.user_id).await?;
        if items.is_empty() {
            txn.rollback().await?;
            return Ok(ApiResponse::success(
                "Cart cleared",
                cart_view(user.user_id, Vec::new()),
                None,
            ));
        }

        if !claim_cart(&txn, user.user_id, cart.version).await? {
            txn.rollback().await?;
            continue;
        }

        CartItems::delete_many()
            .filter(CartItemCol::UserId.eq(user.user_id))
            .exec(&txn)
            .await?;

        let cart = store_total(&txn, user.user_id).await?;
        txn.commit().await?;

        if let Err(err) = log_audit(
            &state.orm,
            Some(user.user_id),
            "cart_clear",
            Some("cart_items"),
            None,
        )
        .await
        {
            tracing::warn!(error = %err, "audit log failed");
        }

        return Ok(ApiResponse::success("Cart cleared", cart, None));
    }

    Err(AppError::ConcurrencyConflict)
}

/// Claim the cart row for this transaction by bumping its version, but only
/// if nobody else committed first. Zero rows affected means a concurrent
/// writer won; the caller rolls back and retries against fresh state.
pub(crate) async fn claim_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    expected_version: i64,
) -> AppResult<bool> {
    let result = Carts::update_many()
        .col_expr(CartCol::Version, Expr::col(CartCol::Version).add(1))
        .filter(CartCol::UserId.eq(user_id))
        .filter(CartCol::Version.eq(expected_version))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

pub(crate) async fn load_items<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> AppResult<Vec<cart_items::Model>> {
    Ok(CartItems::find()
        .filter(CartItemCol::UserId.eq(user_id))
        .order_by_asc(CartItemCol::CreatedAt)
        .all(conn)
        .await?)
}

async fn load_or_create_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> AppResult<carts::Model> {
    if let Some(cart) = Carts::find_by_id(user_id).one(conn).await? {
        return Ok(cart);
    }

    let now = Utc::now();
    let fresh = carts::ActiveModel {
        user_id: Set(user_id),
        version: Set(0),
        total_price: Set(0),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    };
    // Two first-adds can race on the insert; the loser retries and finds the
    // winner's row.
    fresh.insert(conn).await.map_err(|err| match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => AppError::ConcurrencyConflict,
        _ => err.into(),
    })
}

/// Recompute the total from the lines and persist it in the same transaction
/// that changed them, then return the resulting view.
async fn store_total<C: ConnectionTrait>(conn: &C, user_id: Uuid) -> AppResult<Cart> {
    let view = cart_view(user_id, load_items(conn, user_id).await?);
    Carts::update_many()
        .col_expr(CartCol::TotalPrice, Expr::value(view.total_price))
        .col_expr(CartCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(CartCol::UserId.eq(user_id))
        .exec(conn)
        .await?;
    Ok(view)
}

pub(crate) fn cart_view(user_id: Uuid, items: Vec<cart_items::Model>) -> Cart {
    let items: Vec<CartLine> = items.into_iter().map(line_from_entity).collect();
    let total_price = cart_total(&items);
    Cart {
        user_id,
        items,
        total_price,
    }
}

fn line_from_entity(model: cart_items::Model) -> CartLine {
    let subtotal = line_subtotal(model.unit_price, model.quantity);
    CartLine {
        product_id: model.product_id,
        product_name: model.product_name,
        unit_price: model.unit_price,
        quantity: model.quantity,
        subtotal,
    }
}
