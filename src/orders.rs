//! Session line items: the order lines attached to a client's visit.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::clients;
use crate::db::DbState;
use crate::error::{DeskError, DeskResult};
use crate::models::{LineItemStatus, SessionLineItem, LINE_ITEM_COLUMNS};

/// Add a `pending` line for a client.
pub fn add_line_item(
    db: &DbState,
    client_id: &str,
    item_name: &str,
    quantity: i64,
    price: f64,
) -> DeskResult<SessionLineItem> {
    validate_line(item_name, quantity, price)?;
    db.with_conn(|conn| {
        let client = clients::load_client(conn, client_id)?;
        if !client.is_active {
            return Err(DeskError::validation(format!(
                "Client {} is deactivated",
                client.client_code
            )));
        }
        let id = insert_line_item(conn, client_id, item_name.trim(), quantity, price)?;
        info!(line_item_id = %id, client_id = %client_id, item = %item_name, quantity, "Line item added");
        load_line_item(conn, &id)
    })
}

/// Lines for a client, oldest first, optionally filtered by status.
pub fn list_line_items(
    db: &DbState,
    client_id: &str,
    status: Option<LineItemStatus>,
) -> DeskResult<Vec<SessionLineItem>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {LINE_ITEM_COLUMNS} FROM session_line_items
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map(
            params![client_id, status.map(LineItemStatus::as_str)],
            SessionLineItem::from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

/// Move a line to `next`, enforcing the kitchen flow. Staff cancellation
/// goes through here too.
pub fn update_line_item_status(
    db: &DbState,
    line_item_id: &str,
    next: LineItemStatus,
) -> DeskResult<SessionLineItem> {
    db.with_conn(|conn| {
        let current = load_line_item(conn, line_item_id)?;
        if !current.status.can_transition_to(next) {
            return Err(DeskError::validation(format!(
                "Cannot move line item from {} to {}",
                current.status.as_str(),
                next.as_str()
            )));
        }
        conn.execute(
            "UPDATE session_line_items SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![next.as_str(), Utc::now().to_rfc3339(), line_item_id],
        )?;
        load_line_item(conn, line_item_id)
    })
}

/// Bulk-cancel every `pending` line of a client. Returns the number of
/// lines cancelled.
pub fn cancel_pending_for_client(db: &DbState, client_id: &str) -> DeskResult<usize> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE session_line_items SET status = 'cancelled', updated_at = ?1
             WHERE user_id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), client_id],
        )?)
    })
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared with payments/refunds)
// ---------------------------------------------------------------------------

pub(crate) fn validate_line(item_name: &str, quantity: i64, price: f64) -> DeskResult<()> {
    if item_name.trim().is_empty() {
        return Err(DeskError::validation("Item name is required"));
    }
    if quantity <= 0 {
        return Err(DeskError::validation(format!(
            "Quantity must be positive for {item_name}"
        )));
    }
    if !price.is_finite() || price < 0.0 {
        return Err(DeskError::validation(format!(
            "Price must not be negative for {item_name}"
        )));
    }
    Ok(())
}

pub(crate) fn insert_line_item(
    conn: &Connection,
    client_id: &str,
    item_name: &str,
    quantity: i64,
    price: f64,
) -> DeskResult<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO session_line_items (id, user_id, item_name, quantity, price, status,
                                         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
        params![id, client_id, item_name, quantity, price, now],
    )?;
    Ok(id)
}

/// Set every line of `client_id` named `item_name` currently in `from` to
/// `to`. Returns the number of rows touched.
pub(crate) fn bulk_transition_by_name(
    conn: &Connection,
    client_id: &str,
    item_name: &str,
    from: LineItemStatus,
    to: LineItemStatus,
) -> DeskResult<usize> {
    Ok(conn.execute(
        "UPDATE session_line_items SET status = ?1, updated_at = ?2
         WHERE user_id = ?3 AND item_name = ?4 AND status = ?5",
        params![
            to.as_str(),
            Utc::now().to_rfc3339(),
            client_id,
            item_name,
            from.as_str()
        ],
    )?)
}

fn load_line_item(conn: &Connection, line_item_id: &str) -> DeskResult<SessionLineItem> {
    conn.query_row(
        &format!("SELECT {LINE_ITEM_COLUMNS} FROM session_line_items WHERE id = ?1"),
        params![line_item_id],
        SessionLineItem::from_row,
    )
    .optional()?
    .ok_or_else(|| DeskError::not_found(format!("Line item not found: {line_item_id}")))
}
