//! Point-of-sale payment workflow.
//!
//! A payment is four sequential writes: order lines, receipt snapshot,
//! line completion, stock deduction. They are deliberately not wrapped in a
//! transaction, matching the hosted dashboard: if step N fails, steps
//! 1..N-1 stay persisted and the error names the failing step.

use std::collections::BTreeSet;

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::clients;
use crate::db::DbState;
use crate::error::{DeskError, DeskResult, PaymentStep};
use crate::inventory;
use crate::models::{
    round_cents, CartItem, LineItemStatus, PaymentMethod, Receipt, ReceiptLine, RECEIPT_COLUMNS,
};
use crate::orders;

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    #[serde(alias = "user_id")]
    pub client_id: String,
    pub items: Vec<CartItem>,
    pub payment_method: PaymentMethod,
    /// Absolute discount; clamped to the subtotal.
    #[serde(default)]
    pub discount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub receipt: Receipt,
    pub completed_items: usize,
    /// Ingredient rows moved by the stock step.
    pub stock_movements: usize,
}

/// `RCP-<epoch_ms>-<NNN>`. Two receipts issued in the same millisecond
/// collide with probability 1/1000; the UNIQUE constraint on
/// `receipt_number` turns that into a failed insert.
pub fn generate_receipt_number<R: Rng + ?Sized>(epoch_ms: i64, rng: &mut R) -> String {
    format!("RCP-{epoch_ms}-{:03}", rng.gen_range(0..1000))
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Take payment for a cart.
pub fn process_payment(db: &DbState, request: &PaymentRequest) -> DeskResult<PaymentOutcome> {
    validate_request(db, request)?;

    let client_id = request.client_id.as_str();
    let subtotal = round_cents(request.items.iter().map(CartItem::total).sum());
    let discount = round_cents(request.discount.clamp(0.0, subtotal));
    let total = round_cents(subtotal - discount);

    // 1. Order lines.
    db.with_conn(|conn| {
        for item in &request.items {
            orders::insert_line_item(conn, client_id, item.name.trim(), item.quantity, item.price)?;
        }
        Ok(())
    })
    .map_err(fail(PaymentStep::InsertLineItems, client_id))?;

    // 2. Receipt snapshot.
    let receipt_id = db
        .with_conn(|conn| insert_receipt(conn, request, subtotal, discount, total))
        .map_err(fail(PaymentStep::InsertReceipt, client_id))?;

    // 3. Pending lines with a paid name become completed.
    let completed_items = db
        .with_conn(|conn| {
            let names: BTreeSet<&str> = request.items.iter().map(|i| i.name.trim()).collect();
            let mut touched = 0;
            for name in names {
                touched += orders::bulk_transition_by_name(
                    conn,
                    client_id,
                    name,
                    LineItemStatus::Pending,
                    LineItemStatus::Completed,
                )?;
            }
            Ok(touched)
        })
        .map_err(fail(PaymentStep::CompleteLineItems, client_id))?;

    // 4. Stock.
    let mut stock_movements = 0;
    for item in request.items.iter().filter(|i| i.is_product()) {
        stock_movements += db
            .with_conn(|conn| inventory::deduct_for_product(conn, &item.id, item.quantity))
            .map_err(fail(PaymentStep::DeductStock, client_id))?;
    }

    let receipt = get_receipt(db, &receipt_id)?;
    info!(
        receipt_number = %receipt.receipt_number,
        client_id = %client_id,
        method = request.payment_method.as_str(),
        total = receipt.total_amount,
        "Payment recorded"
    );

    Ok(PaymentOutcome {
        receipt,
        completed_items,
        stock_movements,
    })
}

fn validate_request(db: &DbState, request: &PaymentRequest) -> DeskResult<()> {
    if request.items.is_empty() {
        return Err(DeskError::validation("Cart is empty"));
    }
    for item in &request.items {
        orders::validate_line(&item.name, item.quantity, item.price)?;
    }
    if !request.discount.is_finite() || request.discount < 0.0 {
        return Err(DeskError::validation("Discount must not be negative"));
    }
    let client = db.with_conn(|conn| clients::load_client(conn, &request.client_id))?;
    if !client.is_active {
        return Err(DeskError::validation(format!(
            "Client {} is deactivated",
            client.client_code
        )));
    }
    Ok(())
}

fn fail(step: PaymentStep, client_id: &str) -> impl FnOnce(DeskError) -> DeskError + '_ {
    move |e| {
        error!(step = %step, client_id = %client_id, error = %e, "Payment step failed");
        DeskError::at_step(step)(e)
    }
}

fn insert_receipt(
    conn: &Connection,
    request: &PaymentRequest,
    subtotal: f64,
    discount: f64,
    total: f64,
) -> DeskResult<String> {
    let lines: Vec<ReceiptLine> = request.items.iter().map(ReceiptLine::from).collect();
    let snapshot = serde_json::to_string(&lines)
        .map_err(|e| DeskError::Internal(format!("Invalid receipt snapshot: {e}")))?;

    let now = Utc::now();
    let receipt_number = generate_receipt_number(now.timestamp_millis(), &mut rand::thread_rng());
    let id = Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO receipts (id, receipt_number, user_id, line_items, subtotal, discount,
                               total_amount, payment_method, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9)",
        params![
            id,
            receipt_number,
            request.client_id,
            snapshot,
            subtotal,
            discount,
            total,
            request.payment_method.as_str(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Receipt queries
// ---------------------------------------------------------------------------

pub fn get_receipt(db: &DbState, receipt_id: &str) -> DeskResult<Receipt> {
    db.with_conn(|conn| load_receipt(conn, receipt_id))
}

/// Newest first.
pub fn list_receipts_for_client(db: &DbState, client_id: &str) -> DeskResult<Vec<Receipt>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![client_id], Receipt::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

pub(crate) fn load_receipt(conn: &Connection, receipt_id: &str) -> DeskResult<Receipt> {
    conn.query_row(
        &format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?1 OR receipt_number = ?1"),
        params![receipt_id],
        Receipt::from_row,
    )
    .optional()?
    .ok_or_else(|| DeskError::not_found(format!("Receipt not found: {receipt_id}")))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{register_client, NewClient};
    use crate::db;
    use crate::inventory::NewStockItem;
    use crate::models::ReceiptStatus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seed_client(db: &DbState) -> String {
        register_client(
            db,
            &NewClient {
                full_name: "Ada".into(),
                barcode: Some("CLIENT12345".into()),
                ..Default::default()
            },
        )
        .unwrap()
        .id
    }

    fn item(id: &str, name: &str, quantity: i64, price: f64, category: &str) -> CartItem {
        CartItem {
            id: id.into(),
            name: name.into(),
            quantity,
            price,
            category: Some(category.into()),
        }
    }

    #[test]
    fn test_full_payment_workflow() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        let beans = inventory::create_stock_item(
            &db,
            &NewStockItem {
                name: "Beans".into(),
                current_quantity: 100.0,
                ..Default::default()
            },
        )
        .unwrap();
        inventory::set_product_ingredients(&db, "espresso", &[(beans.id.clone(), 9.0)]).unwrap();

        let request = PaymentRequest {
            client_id: client_id.clone(),
            items: vec![
                item("espresso", "Espresso", 2, 2.5, "product"),
                item("day-pass", "Day pass", 1, 15.0, "service"),
            ],
            payment_method: PaymentMethod::Card,
            discount: 2.0,
        };
        let outcome = process_payment(&db, &request).unwrap();

        assert_eq!(outcome.receipt.subtotal, 20.0);
        assert_eq!(outcome.receipt.discount, 2.0);
        assert_eq!(outcome.receipt.total_amount, 18.0);
        assert_eq!(outcome.receipt.status, ReceiptStatus::Active);
        assert_eq!(outcome.receipt.payment_method, "card");
        assert_eq!(outcome.receipt.line_items.len(), 2);
        assert_eq!(outcome.receipt.line_items[0].line_total(), 5.0);
        assert!(outcome.receipt.receipt_number.starts_with("RCP-"));
        assert_eq!(outcome.completed_items, 2);
        assert_eq!(outcome.stock_movements, 1);

        assert_eq!(
            inventory::get_stock_item(&db, &beans.id).unwrap().current_quantity,
            82.0
        );
        let completed =
            orders::list_line_items(&db, &client_id, Some(LineItemStatus::Completed)).unwrap();
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn test_discount_is_clamped_to_subtotal() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        let outcome = process_payment(
            &db,
            &PaymentRequest {
                client_id,
                items: vec![item("tea", "Tea", 1, 3.0, "service")],
                payment_method: PaymentMethod::Cash,
                discount: 10.0,
            },
        )
        .unwrap();
        assert_eq!(outcome.receipt.discount, 3.0);
        assert_eq!(outcome.receipt.total_amount, 0.0);
    }

    #[test]
    fn test_failure_at_stock_step_keeps_earlier_writes() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        inventory::set_product_ingredients(&db, "muffin", &[("ghost-stock".into(), 1.0)])
            .unwrap();

        let err = process_payment(
            &db,
            &PaymentRequest {
                client_id: client_id.clone(),
                items: vec![item("muffin", "Muffin", 1, 3.0, "product")],
                payment_method: PaymentMethod::Cash,
                discount: 0.0,
            },
        )
        .unwrap_err();

        assert!(matches!(
            err,
            DeskError::Workflow {
                step: PaymentStep::DeductStock,
                ..
            }
        ));
        // Not rolled back: the receipt and completed line survive.
        let receipts = list_receipts_for_client(&db, &client_id).unwrap();
        assert_eq!(receipts.len(), 1);
        let completed =
            orders::list_line_items(&db, &client_id, Some(LineItemStatus::Completed)).unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn test_existing_pending_line_with_same_name_is_completed() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        orders::add_line_item(&db, &client_id, "Espresso", 1, 2.5).unwrap();
        let outcome = process_payment(
            &db,
            &PaymentRequest {
                client_id: client_id.clone(),
                items: vec![item("espresso", "Espresso", 1, 2.5, "service")],
                payment_method: PaymentMethod::Cash,
                discount: 0.0,
            },
        )
        .unwrap();
        assert_eq!(outcome.completed_items, 2);
        assert!(
            orders::list_line_items(&db, &client_id, Some(LineItemStatus::Pending))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        let empty = PaymentRequest {
            client_id: client_id.clone(),
            items: vec![],
            payment_method: PaymentMethod::Cash,
            discount: 0.0,
        };
        assert!(matches!(
            process_payment(&db, &empty),
            Err(DeskError::Validation(_))
        ));

        let unknown = PaymentRequest {
            client_id: "nobody".into(),
            items: vec![item("tea", "Tea", 1, 3.0, "service")],
            payment_method: PaymentMethod::Cash,
            discount: 0.0,
        };
        assert!(matches!(
            process_payment(&db, &unknown),
            Err(DeskError::NotFound(_))
        ));
        // Validation failures happen before any write.
        assert!(orders::list_line_items(&db, &client_id, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_receipt_number_format() {
        let mut rng = StdRng::seed_from_u64(7);
        let number = generate_receipt_number(1_700_000_000_123, &mut rng);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "RCP");
        assert_eq!(parts[1], "1700000000123");
        assert_eq!(parts[2].len(), 3);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_receipt_numbers_in_same_millisecond_rarely_collide() {
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 10_000;
        let mut collisions = 0;
        for _ in 0..draws {
            let a = generate_receipt_number(1, &mut rng);
            let b = generate_receipt_number(1, &mut rng);
            if a == b {
                collisions += 1;
            }
        }
        // Expected ~10 (1/1000); bound loosely.
        assert!(collisions > 0, "suffix space should allow collisions");
        assert!(collisions < 40, "collision rate too high: {collisions}");
    }

    #[test]
    fn test_lookup_receipt_by_number() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        let outcome = process_payment(
            &db,
            &PaymentRequest {
                client_id,
                items: vec![item("tea", "Tea", 1, 3.0, "service")],
                payment_method: PaymentMethod::Other,
                discount: 0.0,
            },
        )
        .unwrap();
        let by_number = get_receipt(&db, &outcome.receipt.receipt_number).unwrap();
        assert_eq!(by_number.id, outcome.receipt.id);
        assert!(matches!(
            get_receipt(&db, "RCP-0-000"),
            Err(DeskError::NotFound(_))
        ));
    }

    fn insert_raw_receipt(db: &DbState, client_id: &str, number: &str, line_items: &str) {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO receipts (id, receipt_number, user_id, line_items, subtotal, discount,
                                       total_amount, payment_method, status, created_at)
                 VALUES (?1, ?1, ?2, ?3, 5.0, 0, 5.0, 'cash', 'active', '2025-01-01T00:00:00Z')",
                params![number, client_id, line_items],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_legacy_snapshot_without_totals_is_read() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        insert_raw_receipt(
            &db,
            &client_id,
            "RCP-1-001",
            r#"[{"item_name":"Espresso","quantity":2,"price":2.5},
                {"name":"Water","quantity":1.0,"price":1.0,"total":1.0}]"#,
        );

        let receipt = get_receipt(&db, "RCP-1-001").unwrap();
        assert_eq!(receipt.line_items.len(), 2);
        assert_eq!(receipt.line_items[0].name, "Espresso");
        assert_eq!(receipt.line_items[0].total, None);
        assert_eq!(receipt.line_items[0].line_total(), 5.0);
        assert_eq!(receipt.line_items[1].quantity, 1);
    }

    #[test]
    fn test_unreadable_snapshot_is_an_error() {
        let db = db::test_state();
        let client_id = seed_client(&db);
        insert_raw_receipt(&db, &client_id, "RCP-1-002", r#"[{"quantity":"two"}]"#);

        assert!(matches!(
            get_receipt(&db, "RCP-1-002"),
            Err(DeskError::Storage(_))
        ));
    }
}
