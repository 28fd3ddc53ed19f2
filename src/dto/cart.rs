use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::CartLine;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddToCartRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateQuantityRequest {
    pub product_id: Uuid,
    pub new_quantity: i32,
}

/// The full cart view returned by every cart operation. `total_price` is
/// recomputed with the items inside the same transaction, so the two can
/// never disagree.
#[derive(Debug, Serialize, ToSchema)]
pub struct Cart {
    pub user_id: Uuid,
    pub items: Vec<CartLine>,
    pub total_price: i64,
}
