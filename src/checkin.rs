//! Barcode check-in/check-out.
//!
//! A scan resolves to one non-deleted client and flips its presence. The
//! check-out direction cascades: the open visit is closed, pending order
//! lines are cancelled and an audit row is appended. Each write is its own
//! statement; nothing is rolled back if a later write fails.
//!
//! The audit insert is best-effort and never fails the scan.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients;
use crate::db::DbState;
use crate::error::{DeskError, DeskResult};
use crate::models::{CheckInRecord, CheckInState, Client, CLIENT_COLUMNS};
use crate::orders;

/// Message shown by the scanner UI for an unknown or deleted barcode.
pub const INVALID_BARCODE: &str = "Invalid barcode. Client not found.";

/// What a scan should do. Plain scans toggle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanAction {
    #[default]
    Toggle,
    CheckIn,
    CheckOut,
    /// Resolve the client without changing anything.
    Status,
}

/// A scan as received from the desk scanner or the edge function.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default, alias = "scanned_by_user_id")]
    pub scanned_by: Option<String>,
    #[serde(default)]
    pub action: ScanAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToggleOutcome {
    /// Client after the transition.
    pub client: Client,
    /// Resulting presence, reported as `checked_in` / `checked_out`.
    pub action: CheckInState,
    /// Pending line items cancelled by a check-out.
    pub cancelled_items: usize,
}

// ---------------------------------------------------------------------------
// Scan entry points
// ---------------------------------------------------------------------------

/// Flip the presence of the client matching `barcode` (barcode or client
/// code, surrounding whitespace ignored).
pub fn toggle_client_checkin_status(
    db: &DbState,
    barcode: &str,
    scanned_by: Option<&str>,
) -> DeskResult<ToggleOutcome> {
    process_scan(
        db,
        &ScanRequest {
            barcode: Some(barcode.to_string()),
            scanned_by: scanned_by.map(String::from),
            ..Default::default()
        },
    )
}

/// Resolve the scanned client and apply the requested action.
pub fn process_scan(db: &DbState, request: &ScanRequest) -> DeskResult<ToggleOutcome> {
    let client = resolve_client(db, request)?;
    let scanned_by = request.scanned_by.as_deref();
    let current = client.checkin_state();

    let target = match request.action {
        ScanAction::Status => {
            return Ok(ToggleOutcome {
                client,
                action: current,
                cancelled_items: 0,
            })
        }
        ScanAction::Toggle => current.toggled(),
        ScanAction::CheckIn => CheckInState::CheckedIn,
        ScanAction::CheckOut => CheckInState::CheckedOut,
    };

    if target == current {
        let label = match current {
            CheckInState::CheckedIn => "in",
            CheckInState::CheckedOut => "out",
        };
        return Err(DeskError::validation(format!(
            "Client is already checked {label}"
        )));
    }

    match target {
        CheckInState::CheckedIn => check_in(db, &client, scanned_by),
        CheckInState::CheckedOut => check_out(db, &client, scanned_by),
    }
}

fn resolve_client(db: &DbState, request: &ScanRequest) -> DeskResult<Client> {
    let client_id = request
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let code = request
        .barcode
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let found = match (client_id, code) {
        (Some(id), _) => db.with_conn(|conn| clients::find_active_by_id(conn, id))?,
        (None, Some(code)) => db.with_conn(|conn| clients::find_by_code(conn, code))?,
        (None, None) => return Err(DeskError::validation("Barcode is required")),
    };

    found.ok_or_else(|| {
        warn!(
            barcode = code.unwrap_or_default(),
            client_id = client_id.unwrap_or_default(),
            "Scan did not match any client"
        );
        DeskError::not_found(INVALID_BARCODE)
    })
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

fn check_in(db: &DbState, client: &Client, scanned_by: Option<&str>) -> DeskResult<ToggleOutcome> {
    let now = Utc::now().to_rfc3339();

    db.with_conn(|conn| {
        conn.execute(
            "UPDATE clients SET active = 1, updated_at = ?1 WHERE id = ?2",
            params![now, client.id],
        )?;
        Ok(())
    })?;

    // A dangling open visit (e.g. from a racing scan) is closed so the
    // client never has two.
    let stale = close_open_records(db, &client.id, &now)?;
    if stale > 0 {
        warn!(client_id = %client.id, stale, "Closed dangling open check-in before new visit");
    }

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO check_ins (id, client_id, status, checked_in_at)
             VALUES (?1, ?2, 'checked_in', ?3)",
            params![Uuid::new_v4().to_string(), client.id, now],
        )?;
        Ok(())
    })?;

    write_audit_log(db, &client.id, CheckInState::CheckedIn, scanned_by);

    let client = db.with_conn(|conn| clients::load_client(conn, &client.id))?;
    info!(client_id = %client.id, scanned_by = scanned_by.unwrap_or("-"), "Client checked in");

    Ok(ToggleOutcome {
        client,
        action: CheckInState::CheckedIn,
        cancelled_items: 0,
    })
}

/// Check a client out and cascade: close the open visit, cancel pending
/// order lines, append the audit row.
pub(crate) fn check_out(
    db: &DbState,
    client: &Client,
    scanned_by: Option<&str>,
) -> DeskResult<ToggleOutcome> {
    let now = Utc::now().to_rfc3339();

    db.with_conn(|conn| {
        conn.execute(
            "UPDATE clients SET active = 0, updated_at = ?1 WHERE id = ?2",
            params![now, client.id],
        )?;
        Ok(())
    })?;

    close_open_records(db, &client.id, &now)?;
    let cancelled_items = orders::cancel_pending_for_client(db, &client.id)?;

    write_audit_log(db, &client.id, CheckInState::CheckedOut, scanned_by);

    let client = db.with_conn(|conn| clients::load_client(conn, &client.id))?;
    info!(
        client_id = %client.id,
        cancelled_items,
        scanned_by = scanned_by.unwrap_or("-"),
        "Client checked out"
    );

    Ok(ToggleOutcome {
        client,
        action: CheckInState::CheckedOut,
        cancelled_items,
    })
}

fn close_open_records(db: &DbState, client_id: &str, now: &str) -> DeskResult<usize> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE check_ins SET status = 'checked_out', checked_out_at = ?1
             WHERE client_id = ?2 AND status = 'checked_in' AND checked_out_at IS NULL",
            params![now, client_id],
        )?)
    })
}

fn write_audit_log(db: &DbState, client_id: &str, action: CheckInState, scanned_by: Option<&str>) {
    let result = db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO checkin_logs (client_id, action, scanned_by, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![client_id, action.as_str(), scanned_by, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    });
    if let Err(e) = result {
        warn!(client_id = %client_id, error = %e, "Failed to write check-in audit log");
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// The client's open visit, if any.
pub fn open_record(db: &DbState, client_id: &str) -> DeskResult<Option<CheckInRecord>> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT id, client_id, status, checked_in_at, checked_out_at
                 FROM check_ins
                 WHERE client_id = ?1 AND status = 'checked_in' AND checked_out_at IS NULL
                 ORDER BY checked_in_at DESC
                 LIMIT 1",
                params![client_id],
                CheckInRecord::from_row,
            )
            .optional()?)
    })
}

/// Most recent visits first.
pub fn checkin_history(
    db: &DbState,
    client_id: &str,
    limit: u32,
) -> DeskResult<Vec<CheckInRecord>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, client_id, status, checked_in_at, checked_out_at
             FROM check_ins
             WHERE client_id = ?1
             ORDER BY checked_in_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client_id, limit], CheckInRecord::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

/// Clients currently on premises.
pub fn checked_in_clients(db: &DbState) -> DeskResult<Vec<Client>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients
             WHERE is_active = 1 AND active = 1
             ORDER BY full_name COLLATE NOCASE"
        ))?;
        let rows = stmt.query_map([], Client::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{register_client, NewClient};
    use crate::db;
    use crate::models::LineItemStatus;

    fn seed_client(db: &DbState, barcode: &str) -> Client {
        register_client(
            db,
            &NewClient {
                full_name: "Ada Lovelace".into(),
                barcode: Some(barcode.into()),
                ..Default::default()
            },
        )
        .expect("register client")
    }

    fn count(db: &DbState, sql: &str, client_id: &str) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.query_row(sql, params![client_id], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_first_scan_checks_in() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");

        let outcome = toggle_client_checkin_status(&db, "CLIENT12345", Some("staff-1")).unwrap();
        assert_eq!(outcome.action, CheckInState::CheckedIn);
        assert!(outcome.client.active);

        let open = open_record(&db, &client.id).unwrap().expect("open visit");
        assert_eq!(open.status, CheckInState::CheckedIn);
        assert!(open.checked_out_at.is_none());
    }

    #[test]
    fn test_second_scan_checks_out_and_cancels_pending_items() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");
        toggle_client_checkin_status(&db, "CLIENT12345", None).unwrap();

        for name in ["Espresso", "Croissant", "Day pass"] {
            orders::add_line_item(&db, &client.id, name, 1, 2.5).unwrap();
        }
        let served = orders::add_line_item(&db, &client.id, "Tea", 1, 2.0).unwrap();
        orders::update_line_item_status(&db, &served.id, LineItemStatus::Preparing).unwrap();

        let outcome = toggle_client_checkin_status(&db, "CLIENT12345", None).unwrap();
        assert_eq!(outcome.action, CheckInState::CheckedOut);
        assert!(!outcome.client.active);
        assert_eq!(outcome.cancelled_items, 3);

        let pending = orders::list_line_items(&db, &client.id, Some(LineItemStatus::Pending))
            .unwrap();
        assert!(pending.is_empty());
        let cancelled = orders::list_line_items(&db, &client.id, Some(LineItemStatus::Cancelled))
            .unwrap();
        assert_eq!(cancelled.len(), 3);
        // Lines already in preparation are left alone.
        let preparing = orders::list_line_items(&db, &client.id, Some(LineItemStatus::Preparing))
            .unwrap();
        assert_eq!(preparing.len(), 1);

        assert!(open_record(&db, &client.id).unwrap().is_none());
        let history = checkin_history(&db, &client.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CheckInState::CheckedOut);
        assert!(history[0].checked_out_at.is_some());
    }

    #[test]
    fn test_active_alternates_and_double_toggle_is_identity() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");
        let mut expected = client.active;
        for _ in 0..6 {
            let outcome = toggle_client_checkin_status(&db, "CLIENT12345", None).unwrap();
            expected = !expected;
            assert_eq!(outcome.client.active, expected);
        }
        let after = clients::get_client(&db, &client.id).unwrap();
        assert_eq!(after.active, client.active);
        assert_eq!(
            count(
                &db,
                "SELECT COUNT(*) FROM checkin_logs WHERE client_id = ?1",
                &client.id
            ),
            6
        );
    }

    #[test]
    fn test_at_most_one_open_record() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");
        // Simulate a dangling visit left behind by an interrupted check-out.
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO check_ins (id, client_id, status, checked_in_at)
                 VALUES ('stale', ?1, 'checked_in', '2024-01-01T08:00:00Z')",
                params![client.id],
            )
            .unwrap();
        }
        toggle_client_checkin_status(&db, "CLIENT12345", None).unwrap();
        assert_eq!(
            count(
                &db,
                "SELECT COUNT(*) FROM check_ins
                 WHERE client_id = ?1 AND status = 'checked_in' AND checked_out_at IS NULL",
                &client.id
            ),
            1
        );
    }

    #[test]
    fn test_unknown_barcode_is_not_found() {
        let db = db::test_state();
        seed_client(&db, "CLIENT12345");
        let err = toggle_client_checkin_status(&db, "ZZZZZZ", None).unwrap_err();
        assert!(matches!(err, DeskError::NotFound(ref m) if m.starts_with("Invalid barcode")));
    }

    #[test]
    fn test_blank_scan_is_validation_error() {
        let db = db::test_state();
        let err = toggle_client_checkin_status(&db, "   ", None).unwrap_err();
        assert!(matches!(err, DeskError::Validation(_)));
    }

    #[test]
    fn test_scan_input_is_trimmed_and_matches_client_code() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");
        let outcome =
            toggle_client_checkin_status(&db, &format!("  {}\n", client.client_code), None)
                .unwrap();
        assert_eq!(outcome.client.id, client.id);
    }

    #[test]
    fn test_deleted_client_cannot_scan() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");
        clients::deactivate_client(&db, &client.id, None).unwrap();
        assert!(matches!(
            toggle_client_checkin_status(&db, "CLIENT12345", None),
            Err(DeskError::NotFound(_))
        ));
    }

    #[test]
    fn test_explicit_actions() {
        let db = db::test_state();
        let client = seed_client(&db, "CLIENT12345");
        let by_id = |action| ScanRequest {
            client_id: Some(client.id.clone()),
            action,
            ..Default::default()
        };

        let err = process_scan(&db, &by_id(ScanAction::CheckOut)).unwrap_err();
        assert_eq!(err.to_string(), "Client is already checked out");

        let status = process_scan(&db, &by_id(ScanAction::Status)).unwrap();
        assert_eq!(status.action, CheckInState::CheckedOut);
        assert!(!status.client.active);

        let checked_in = process_scan(&db, &by_id(ScanAction::CheckIn)).unwrap();
        assert!(checked_in.client.active);
        assert_eq!(checked_in_clients(&db).unwrap().len(), 1);

        let err = process_scan(&db, &by_id(ScanAction::CheckIn)).unwrap_err();
        assert_eq!(err.to_string(), "Client is already checked in");
    }

    #[test]
    fn test_audit_failure_does_not_fail_scan() {
        let db = db::test_state();
        seed_client(&db, "CLIENT12345");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute_batch("DROP TABLE checkin_logs;").unwrap();
        }
        let outcome = toggle_client_checkin_status(&db, "CLIENT12345", None).unwrap();
        assert_eq!(outcome.action, CheckInState::CheckedIn);
    }
}
