//! Stock items and product recipes.
//!
//! Selling a `product` consumes `quantity_needed * sold` of every stock
//! item in its recipe (floored at zero); refunding puts it back.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{DeskError, DeskResult};
use crate::models::{ProductIngredient, StockItem};

const STOCK_COLUMNS: &str = "id, name, current_quantity, min_quantity, cost_per_unit";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewStockItem {
    pub name: String,
    #[serde(default)]
    pub current_quantity: f64,
    #[serde(default)]
    pub min_quantity: f64,
    #[serde(default)]
    pub cost_per_unit: f64,
}

pub fn create_stock_item(db: &DbState, new: &NewStockItem) -> DeskResult<StockItem> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(DeskError::validation("Stock item name is required"));
    }
    for (label, value) in [
        ("current_quantity", new.current_quantity),
        ("min_quantity", new.min_quantity),
        ("cost_per_unit", new.cost_per_unit),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(DeskError::validation(format!("{label} must not be negative")));
        }
    }

    db.with_conn(|conn| {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO stock (id, name, current_quantity, min_quantity, cost_per_unit)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                name,
                new.current_quantity,
                new.min_quantity,
                new.cost_per_unit
            ],
        )?;
        info!(stock_id = %id, name = %name, "Stock item created");
        load_stock_item(conn, &id)
    })
}

pub fn get_stock_item(db: &DbState, stock_id: &str) -> DeskResult<StockItem> {
    db.with_conn(|conn| load_stock_item(conn, stock_id))
}

/// Manual correction (delivery, waste). The result never drops below zero.
pub fn adjust_stock(db: &DbState, stock_id: &str, delta: f64) -> DeskResult<StockItem> {
    if !delta.is_finite() {
        return Err(DeskError::validation("Adjustment must be a number"));
    }
    db.with_conn(|conn| {
        apply_delta(conn, stock_id, delta)?;
        load_stock_item(conn, stock_id)
    })
}

/// Replace the recipe of a product.
pub fn set_product_ingredients(
    db: &DbState,
    product_id: &str,
    ingredients: &[(String, f64)],
) -> DeskResult<Vec<ProductIngredient>> {
    if let Some((stock_id, _)) = ingredients
        .iter()
        .find(|(_, qty)| !qty.is_finite() || *qty <= 0.0)
    {
        return Err(DeskError::validation(format!(
            "quantity_needed must be positive for stock {stock_id}"
        )));
    }

    let conn = db.conn.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> DeskResult<()> {
        conn.execute(
            "DELETE FROM product_ingredients WHERE product_id = ?1",
            params![product_id],
        )?;
        for (stock_id, qty) in ingredients {
            conn.execute(
                "INSERT INTO product_ingredients (product_id, stock_id, quantity_needed)
                 VALUES (?1, ?2, ?3)",
                params![product_id, stock_id, qty],
            )?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }
    drop(conn);

    info!(product_id = %product_id, count = ingredients.len(), "Product recipe updated");
    product_ingredients(db, product_id)
}

pub fn product_ingredients(db: &DbState, product_id: &str) -> DeskResult<Vec<ProductIngredient>> {
    db.with_conn(|conn| load_ingredients(conn, product_id))
}

/// Items at or below their minimum, emptiest first.
pub fn low_stock_items(db: &DbState) -> DeskResult<Vec<StockItem>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {STOCK_COLUMNS} FROM stock
             WHERE current_quantity <= min_quantity
             ORDER BY current_quantity, name"
        ))?;
        let rows = stmt.query_map([], StockItem::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

// ---------------------------------------------------------------------------
// Sale / refund movements
// ---------------------------------------------------------------------------

/// Consume the recipe of `product_id` for `sold` units. Each ingredient is
/// its own update; a missing stock row stops the loop with `NotFound` and
/// leaves earlier ingredients decremented.
pub(crate) fn deduct_for_product(conn: &Connection, product_id: &str, sold: i64) -> DeskResult<usize> {
    move_recipe(conn, product_id, -(sold as f64))
}

/// Return the recipe of `product_id` for `returned` units to stock.
pub(crate) fn restock_for_product(
    conn: &Connection,
    product_id: &str,
    returned: i64,
) -> DeskResult<usize> {
    move_recipe(conn, product_id, returned as f64)
}

fn move_recipe(conn: &Connection, product_id: &str, units: f64) -> DeskResult<usize> {
    let ingredients = load_ingredients(conn, product_id)?;
    if ingredients.is_empty() {
        debug!(product_id = %product_id, "Product has no recipe, stock untouched");
    }
    for ingredient in &ingredients {
        apply_delta(conn, &ingredient.stock_id, ingredient.quantity_needed * units)?;
    }
    Ok(ingredients.len())
}

fn apply_delta(conn: &Connection, stock_id: &str, delta: f64) -> DeskResult<()> {
    let changed = conn.execute(
        "UPDATE stock SET current_quantity = MAX(current_quantity + ?1, 0), updated_at = ?2
         WHERE id = ?3",
        params![delta, Utc::now().to_rfc3339(), stock_id],
    )?;
    if changed == 0 {
        warn!(stock_id = %stock_id, "Stock movement references unknown stock item");
        return Err(DeskError::not_found(format!("Stock item not found: {stock_id}")));
    }
    Ok(())
}

fn load_ingredients(conn: &Connection, product_id: &str) -> DeskResult<Vec<ProductIngredient>> {
    let mut stmt = conn.prepare(
        "SELECT product_id, stock_id, quantity_needed FROM product_ingredients
         WHERE product_id = ?1
         ORDER BY stock_id",
    )?;
    let rows = stmt.query_map(params![product_id], |row| {
        Ok(ProductIngredient {
            product_id: row.get(0)?,
            stock_id: row.get(1)?,
            quantity_needed: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn load_stock_item(conn: &Connection, stock_id: &str) -> DeskResult<StockItem> {
    conn.query_row(
        &format!("SELECT {STOCK_COLUMNS} FROM stock WHERE id = ?1"),
        params![stock_id],
        StockItem::from_row,
    )
    .optional()?
    .ok_or_else(|| DeskError::not_found(format!("Stock item not found: {stock_id}")))
}
