use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub price: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One product's entry within a cart. `product_name` and `unit_price` are
/// snapshots taken from the catalog when the line was last added, so later
/// catalog edits do not change carts that already hold the item.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: i64,
    pub quantity: i32,
    pub subtotal: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub products_ordered: Vec<OrderLine>,
    pub total_price: i64,
    pub purchased_on: DateTime<Utc>,
}

/// Order lines keep quantity only; the price of the purchase lives on the
/// order as `total_price`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
}

pub fn line_subtotal(unit_price: i64, quantity: i32) -> i64 {
    unit_price * quantity as i64
}

/// The cart total is always derived from the lines that justify it, never
/// carried independently.
pub fn cart_total(lines: &[CartLine]) -> i64 {
    lines
        .iter()
        .map(|line| line_subtotal(line.unit_price, line.quantity))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(unit_price: i64, quantity: i32) -> CartLine {
        CartLine {
            product_id: Uuid::new_v4(),
            product_name: "widget".into(),
            unit_price,
            quantity,
            subtotal: line_subtotal(unit_price, quantity),
        }
    }

    #[test]
    fn subtotal_is_price_times_quantity() {
        assert_eq!(line_subtotal(100, 2), 200);
        assert_eq!(line_subtotal(50, 1), 50);
    }

    #[test]
    fn total_is_sum_of_line_subtotals() {
        let lines = vec![line(100, 2), line(50, 1)];
        assert_eq!(cart_total(&lines), 250);
    }

    #[test]
    fn empty_cart_totals_zero() {
        assert_eq!(cart_total(&[]), 0);
    }
}
