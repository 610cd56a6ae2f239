//! Receipt cancellation (refunds).
//!
//! **Rules:**
//! - Only an `active` receipt can be cancelled, and only once
//! - The acting staff session must hold `refund_receipt`
//! - Product lines put their recipe back into stock
//! - One completed order line per snapshot line is cancelled
//!
//! Like the payment workflow, the writes are sequential and not rolled back
//! on a later failure.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::Session;
use crate::db::DbState;
use crate::error::{DeskError, DeskResult};
use crate::inventory;
use crate::models::{Receipt, ReceiptStatus};
use crate::payments;

#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub receipt: Receipt,
    pub cancelled_items: usize,
    pub restocked_products: usize,
}

/// Cancel a receipt on behalf of `session`.
pub fn cancel_receipt(
    db: &DbState,
    receipt_id: &str,
    session: &Session,
    reason: &str,
) -> DeskResult<RefundOutcome> {
    session.require("refund_receipt")?;
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(DeskError::validation("Cancellation reason is required"));
    }

    let receipt = payments::get_receipt(db, receipt_id)?;
    if receipt.status == ReceiptStatus::Cancelled {
        return Err(DeskError::validation(format!(
            "Receipt {} is already cancelled",
            receipt.receipt_number
        )));
    }

    db.with_conn(|conn| {
        // Guard on status so two racing refunds cannot both flip it.
        let changed = conn.execute(
            "UPDATE receipts SET status = 'cancelled', cancelled_at = ?1,
                    cancelled_by = ?2, cancellation_reason = ?3
             WHERE id = ?4 AND status = 'active'",
            params![
                Utc::now().to_rfc3339(),
                session.staff_id,
                reason,
                receipt.id
            ],
        )?;
        if changed == 0 {
            return Err(DeskError::validation(format!(
                "Receipt {} is already cancelled",
                receipt.receipt_number
            )));
        }
        Ok(())
    })?;

    let mut restocked_products = 0;
    for line in &receipt.line_items {
        if line.category.as_deref() != Some("product") {
            continue;
        }
        let Some(product_id) = line.product_id.as_deref() else {
            warn!(receipt = %receipt.receipt_number, item = %line.name, "Product line without product id, not restocked");
            continue;
        };
        db.with_conn(|conn| inventory::restock_for_product(conn, product_id, line.quantity))?;
        restocked_products += 1;
    }

    let cancelled_items = db.with_conn(|conn| {
        let mut total = 0;
        for line in &receipt.line_items {
            total += cancel_one_completed(conn, &receipt.user_id, &line.name)?;
        }
        Ok(total)
    })?;

    let receipt = payments::get_receipt(db, &receipt.id)?;
    info!(
        receipt = %receipt.receipt_number,
        cancelled_by = %session.staff_id,
        cancelled_items,
        restocked_products,
        "Receipt cancelled"
    );

    Ok(RefundOutcome {
        receipt,
        cancelled_items,
        restocked_products,
    })
}

/// Cancel the most recent completed line named `item_name`.
fn cancel_one_completed(conn: &Connection, client_id: &str, item_name: &str) -> DeskResult<usize> {
    Ok(conn.execute(
        "UPDATE session_line_items SET status = 'cancelled', updated_at = ?1
         WHERE id = (
            SELECT id FROM session_line_items
            WHERE user_id = ?2 AND item_name = ?3 AND status = 'completed'
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
         )",
        params![Utc::now().to_rfc3339(), client_id, item_name],
    )?)
}
