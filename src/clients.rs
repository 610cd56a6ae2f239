//! Client registry: registration, lookup and soft deactivation.
//!
//! Clients are never hard-deleted. `is_active = 0` hides them from scans
//! and listings; `active` tracks presence and is owned by `checkin`.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkin;
use crate::db::DbState;
use crate::error::{DeskError, DeskResult};
use crate::models::{Client, CLIENT_COLUMNS};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewClient {
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub client_code: Option<String>,
}

/// Attempts at finding a free generated code before giving up.
const MAX_CODE_ATTEMPTS: i64 = 1000;

/// Register a new client. Missing codes are derived from the registry
/// sequence (`CL00042` / `CLIENT00042`), skipping numbers already taken.
/// A barcode or client code may not appear in either column of another
/// client, so a scan always resolves to one row.
pub fn register_client(db: &DbState, new: &NewClient) -> DeskResult<Client> {
    let full_name = new.full_name.trim();
    if full_name.is_empty() {
        return Err(DeskError::validation("Full name is required"));
    }
    let email = non_empty(new.email.as_deref());
    if let Some(ref e) = email {
        if !e.contains('@') {
            return Err(DeskError::validation(format!("Invalid email: {e}")));
        }
    }
    let phone = non_empty(new.phone.as_deref()).map(|p| normalize_phone(&p));
    let explicit_code = non_empty(new.client_code.as_deref());
    let explicit_barcode = non_empty(new.barcode.as_deref());

    db.with_conn(|conn| {
        if let Some(ref code) = explicit_code {
            if code_in_use(conn, code)? {
                return Err(DeskError::validation(format!(
                    "Client code already registered: {code}"
                )));
            }
        }
        if let Some(ref barcode) = explicit_barcode {
            if code_in_use(conn, barcode)? {
                return Err(DeskError::validation(format!(
                    "Barcode already registered: {barcode}"
                )));
            }
        }

        let (client_code, barcode) =
            allocate_codes(conn, explicit_code.as_deref(), explicit_barcode.as_deref())?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO clients (id, client_code, barcode, full_name, phone, email,
                                  active, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 1, ?7, ?7)",
            params![id, client_code, barcode, full_name, phone, email, now],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => DeskError::validation(format!(
                "Client code {client_code} or barcode {barcode} already registered"
            )),
            _ => DeskError::from(e),
        })?;

        info!(client_id = %id, client_code = %client_code, "Client registered");
        load_client(conn, &id)
    })
}

/// Fill in missing codes from the first free sequence number at or after
/// `COUNT(*) + 1`.
fn allocate_codes(
    conn: &Connection,
    explicit_code: Option<&str>,
    explicit_barcode: Option<&str>,
) -> DeskResult<(String, String)> {
    let first: i64 = conn.query_row("SELECT COUNT(*) + 1 FROM clients", [], |row| row.get(0))?;
    for seq in first..first + MAX_CODE_ATTEMPTS {
        let client_code = match explicit_code {
            Some(code) => code.to_string(),
            None => {
                let code = format!("CL{seq:05}");
                if code_in_use(conn, &code)? || explicit_barcode == Some(code.as_str()) {
                    continue;
                }
                code
            }
        };
        let barcode = match explicit_barcode {
            Some(barcode) => barcode.to_string(),
            None => {
                let barcode = format!("CLIENT{seq:05}");
                if code_in_use(conn, &barcode)? || barcode == client_code {
                    continue;
                }
                barcode
            }
        };
        if seq != first {
            debug!(seq, first, "Skipped taken client code numbers");
        }
        return Ok((client_code, barcode));
    }
    Err(DeskError::Internal(format!(
        "No free client code between {first} and {}",
        first + MAX_CODE_ATTEMPTS - 1
    )))
}

/// Whether `code` is already some client's barcode or client code,
/// deactivated clients included.
fn code_in_use(conn: &Connection, code: &str) -> DeskResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE barcode = ?1 OR client_code = ?1)",
        params![code],
        |row| row.get(0),
    )?)
}

pub fn get_client(db: &DbState, client_id: &str) -> DeskResult<Client> {
    db.with_conn(|conn| load_client(conn, client_id))
}

/// List clients ordered by name. Soft-deleted clients are included only on
/// request.
pub fn list_clients(db: &DbState, include_inactive: bool) -> DeskResult<Vec<Client>> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients
             WHERE (?1 = 1 OR is_active = 1)
             ORDER BY full_name COLLATE NOCASE"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![include_inactive], Client::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

/// Soft-deactivate a client. A client still on premises is checked out
/// first so no open visit is left behind.
pub fn deactivate_client(
    db: &DbState,
    client_id: &str,
    staff_id: Option<&str>,
) -> DeskResult<Client> {
    let client = get_client(db, client_id)?;
    if !client.is_active {
        return Ok(client);
    }
    if client.active {
        checkin::check_out(db, &client, staff_id)?;
    }
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE clients SET is_active = 0, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), client_id],
        )?;
        info!(client_id = %client_id, "Client deactivated");
        load_client(conn, client_id)
    })
}

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

pub(crate) fn load_client(conn: &Connection, client_id: &str) -> DeskResult<Client> {
    conn.query_row(
        &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
        params![client_id],
        Client::from_row,
    )
    .optional()?
    .ok_or_else(|| DeskError::not_found(format!("Client not found: {client_id}")))
}

/// Find the single non-deleted client whose barcode or client code equals
/// `code` (already trimmed). A code matching two clients is rejected rather
/// than resolved to either.
pub(crate) fn find_by_code(conn: &Connection, code: &str) -> DeskResult<Option<Client>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients
         WHERE is_active = 1 AND (barcode = ?1 OR client_code = ?1)
         LIMIT 2"
    ))?;
    let mut matches = stmt
        .query_map(params![code], Client::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    if matches.len() > 1 {
        warn!(code = %code, "Scanned code matches more than one client");
        return Err(DeskError::validation(format!(
            "Code {code} matches more than one client"
        )));
    }
    Ok(matches.pop())
}

pub(crate) fn find_active_by_id(conn: &Connection, client_id: &str) -> DeskResult<Option<Client>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE is_active = 1 AND id = ?1"),
            params![client_id],
            Client::from_row,
        )
        .optional()?)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Keep digits and a leading `+`.
fn normalize_phone(value: &str) -> String {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if value.trim_start().starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn new_client(name: &str, barcode: Option<&str>) -> NewClient {
        NewClient {
            full_name: name.into(),
            barcode: barcode.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_generates_codes() {
        let db = db::test_state();
        let first = register_client(&db, &new_client("Ada Lovelace", None)).unwrap();
        let second = register_client(&db, &new_client("Alan Turing", None)).unwrap();
        assert_eq!(first.client_code, "CL00001");
        assert_eq!(first.barcode, "CLIENT00001");
        assert_eq!(second.client_code, "CL00002");
        assert!(!first.active);
        assert!(first.is_active);
    }

    #[test]
    fn test_register_rejects_duplicate_barcode() {
        let db = db::test_state();
        register_client(&db, &new_client("Ada", Some("CLIENT12345"))).unwrap();
        let err = register_client(&db, &new_client("Bob", Some("CLIENT12345"))).unwrap_err();
        assert!(matches!(err, DeskError::Validation(_)), "got {err:?}");
    }

    #[test]
    fn test_register_validates_input() {
        let db = db::test_state();
        assert!(matches!(
            register_client(&db, &new_client("   ", None)),
            Err(DeskError::Validation(_))
        ));
        let bad_email = NewClient {
            full_name: "Eve".into(),
            email: Some("not-an-email".into()),
            ..Default::default()
        };
        assert!(matches!(
            register_client(&db, &bad_email),
            Err(DeskError::Validation(_))
        ));
    }

    #[test]
    fn test_phone_is_normalized() {
        let db = db::test_state();
        let client = register_client(
            &db,
            &NewClient {
                full_name: "Grace".into(),
                phone: Some("+30 (210) 555-0101".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(client.phone.as_deref(), Some("+302105550101"));
    }

    #[test]
    fn test_deactivated_client_is_hidden_from_lookup_and_listing() {
        let db = db::test_state();
        let client = register_client(&db, &new_client("Ada", Some("CLIENT12345"))).unwrap();
        let deactivated = deactivate_client(&db, &client.id, None).unwrap();
        assert!(!deactivated.is_active);

        let conn = db.conn.lock().unwrap();
        assert!(find_by_code(&conn, "CLIENT12345").unwrap().is_none());
        drop(conn);

        assert!(list_clients(&db, false).unwrap().is_empty());
        assert_eq!(list_clients(&db, true).unwrap().len(), 1);
    }

    #[test]
    fn test_deactivate_checks_out_present_client() {
        let db = db::test_state();
        let client = register_client(&db, &new_client("Ada", Some("CLIENT12345"))).unwrap();
        checkin::toggle_client_checkin_status(&db, "CLIENT12345", None).unwrap();

        let deactivated = deactivate_client(&db, &client.id, Some("staff-1")).unwrap();
        assert!(!deactivated.active);
        assert!(checkin::open_record(&db, &client.id).unwrap().is_none());
    }

    #[test]
    fn test_find_by_client_code() {
        let db = db::test_state();
        let client = register_client(&db, &new_client("Ada", Some("CLIENT12345"))).unwrap();
        let conn = db.conn.lock().unwrap();
        let found = find_by_code(&conn, &client.client_code).unwrap().unwrap();
        assert_eq!(found.id, client.id);
    }

    #[test]
    fn test_generated_codes_skip_numbers_taken_explicitly() {
        let db = db::test_state();
        let first = register_client(
            &db,
            &NewClient {
                full_name: "Ada".into(),
                client_code: Some("CL00002".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(first.barcode, "CLIENT00001");

        let second = register_client(&db, &new_client("Bob", None)).unwrap();
        let third = register_client(&db, &new_client("Cyd", None)).unwrap();
        assert_eq!(second.client_code, "CL00003");
        assert_eq!(second.barcode, "CLIENT00003");
        assert_eq!(third.client_code, "CL00004");
    }

    #[test]
    fn test_duplicate_client_code_is_named_in_error() {
        let db = db::test_state();
        register_client(&db, &new_client("Ada", None)).unwrap();
        let err = register_client(
            &db,
            &NewClient {
                full_name: "Bob".into(),
                client_code: Some("CL00001".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Client code already registered: CL00001");
    }

    #[test]
    fn test_code_cannot_shadow_another_clients_barcode() {
        let db = db::test_state();
        let ada = register_client(&db, &new_client("Ada", Some("CL00002"))).unwrap();
        let bob = register_client(&db, &new_client("Bob", None)).unwrap();
        assert_ne!(bob.client_code, "CL00002");

        let err = register_client(
            &db,
            &NewClient {
                full_name: "Cyd".into(),
                client_code: Some("CL00002".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, DeskError::Validation(_)));

        let conn = db.conn.lock().unwrap();
        assert_eq!(find_by_code(&conn, "CL00002").unwrap().unwrap().id, ada.id);
    }

    #[test]
    fn test_ambiguous_code_is_rejected() {
        let db = db::test_state();
        let ada = register_client(&db, &new_client("Ada", Some("SHARED1"))).unwrap();
        let bob = register_client(&db, &new_client("Bob", None)).unwrap();
        let conn = db.conn.lock().unwrap();
        // Rows written before the cross-column check existed.
        conn.execute(
            "UPDATE clients SET client_code = 'SHARED1' WHERE id = ?1",
            params![bob.id],
        )
        .unwrap();

        assert!(matches!(
            find_by_code(&conn, "SHARED1"),
            Err(DeskError::Validation(_))
        ));
        assert_eq!(find_by_code(&conn, &ada.client_code).unwrap().unwrap().id, ada.id);
    }
}
