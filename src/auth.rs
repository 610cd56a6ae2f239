//! PIN-based staff sessions with bcrypt.
//!
//! Sessions are explicit values: `sign_in` hands back a `Session` carrying a
//! bearer token, every privileged call resolves that token through
//! `AuthState::validate`, and `sign_out` drops it. PIN hashes and lockout
//! counters live in `local_settings` (category "staff") so they survive a
//! restart; sessions themselves are in-memory only.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::db::{self, DbState};
use crate::error::{DeskError, DeskResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 10;
const TOKEN_LEN: usize = 40;
const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

#[cfg(not(test))]
const PIN_HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const PIN_HASH_COST: u32 = 4;

const ADMIN_PERMISSIONS: &[&str] = &[
    "checkin",
    "create_order",
    "take_payment",
    "refund_receipt",
    "manage_clients",
    "manage_stock",
];

const STAFF_PERMISSIONS: &[&str] = &["checkin", "create_order", "take_payment"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Staff,
}

impl Role {
    fn pin_key(self) -> &'static str {
        match self {
            Role::Admin => "admin_pin_hash",
            Role::Staff => "staff_pin_hash",
        }
    }

    fn staff_id(self) -> &'static str {
        match self {
            Role::Admin => "admin-user",
            Role::Staff => "staff-user",
        }
    }

    fn permissions(self) -> &'static [&'static str] {
        match self {
            Role::Admin => ADMIN_PERMISSIONS,
            Role::Staff => STAFF_PERMISSIONS,
        }
    }
}

/// An authenticated staff session.
#[derive(Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    #[serde(serialize_with = "serialize_token")]
    pub token: Zeroizing<String>,
    pub staff_id: String,
    pub role: Role,
    pub login_time: DateTime<Utc>,
    #[serde(skip)]
    last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("token", &"***")
            .field("staff_id", &self.staff_id)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn serialize_token<S: serde::Serializer>(
    token: &Zeroizing<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(token.as_str())
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }

    pub fn can(&self, permission: &str) -> bool {
        self.role.permissions().contains(&permission)
    }

    /// Fail with `Unauthorized` unless the session grants `permission`.
    pub fn require(&self, permission: &str) -> DeskResult<()> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(DeskError::Unauthorized(format!(
                "Permission denied: {permission}"
            )))
        }
    }
}

/// Lockout tracking entry.
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// Live sessions for this process. Created at startup, cleared on
/// shutdown via `sign_out_all`.
pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
    lockout: Mutex<LockoutEntry>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lockout: Mutex::new(LockoutEntry {
                attempts: 0,
                last_attempt: Utc::now(),
            }),
        }
    }

    /// Verify `pin` against the stored admin then staff hash and open a
    /// session.
    pub fn sign_in(&self, db: &DbState, pin: &str) -> DeskResult<Session> {
        let pin = Zeroizing::new(pin.trim().to_string());
        if pin.is_empty() {
            return Err(DeskError::validation("PIN is required"));
        }

        // Hashes are read under the connection lock; bcrypt runs without it.
        let hashes: Vec<(Role, String)> = {
            let conn = db.conn.lock()?;
            let mut lockout = self.lockout.lock()?;
            *lockout = load_lockout_from_db(&conn);
            check_lockout(&lockout)?;
            let stored: Vec<(Role, String)> = [Role::Admin, Role::Staff]
                .into_iter()
                .filter_map(|role| {
                    db::get_setting(&conn, "staff", role.pin_key()).map(|hash| (role, hash))
                })
                .collect();
            stored
        };

        let matched = hashes
            .iter()
            .find(|(_, hash)| bcrypt::verify(pin.as_str(), hash).unwrap_or(false))
            .map(|(role, _)| *role);

        let conn = db.conn.lock()?;
        let mut lockout = self.lockout.lock()?;
        lockout.last_attempt = Utc::now();
        match matched {
            Some(role) => {
                lockout.attempts = 0;
                persist_lockout_to_db(&conn, &lockout);
                drop(lockout);
                drop(conn);
                Ok(self.open_session(role))
            }
            None => {
                lockout.attempts += 1;
                warn!(attempts = lockout.attempts, "failed sign-in attempt");
                persist_lockout_to_db(&conn, &lockout);
                Err(DeskError::Unauthorized("Invalid PIN".into()))
            }
        }
    }

    /// Resolve a bearer token to a live session and refresh its inactivity
    /// timer. Expired sessions are dropped.
    pub fn validate(&self, token: &str) -> DeskResult<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock()?;
        let expired = match sessions.get_mut(token) {
            None => return Err(DeskError::Unauthorized("Session not found".into())),
            Some(session) if session.is_expired(now) => true,
            Some(session) => {
                session.last_activity = now;
                return Ok(session.clone());
            }
        };
        if expired {
            if let Some((mut key, session)) = sessions.remove_entry(token) {
                key.zeroize();
                info!(session_id = %session.session_id, "session expired");
            }
        }
        Err(DeskError::Unauthorized("Session expired".into()))
    }

    /// End a session. Returns whether the token was live.
    pub fn sign_out(&self, token: &str) -> DeskResult<bool> {
        let mut sessions = self.sessions.lock()?;
        match sessions.remove_entry(token) {
            Some((mut key, session)) => {
                key.zeroize();
                info!(session_id = %session.session_id, staff_id = %session.staff_id, "signed out");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn sign_out_all(&self) -> DeskResult<usize> {
        let mut sessions = self.sessions.lock()?;
        let count = sessions.len();
        for (mut key, _) in sessions.drain() {
            key.zeroize();
        }
        Ok(count)
    }

    fn open_session(&self, role: Role) -> Session {
        let now = Utc::now();
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            token: Zeroizing::new(token.clone()),
            staff_id: role.staff_id().to_string(),
            role,
            login_time: now,
            last_activity: now,
            expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
        };
        info!(session_id = %session.session_id, role = ?role, "sign-in successful");
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(token, session.clone());
        }
        session
    }
}

/// Hash and store the PIN for `role`. PINs are 4-8 digits.
pub fn set_pin(db: &DbState, role: Role, pin: &str) -> DeskResult<()> {
    let pin = Zeroizing::new(pin.trim().to_string());
    if pin.len() < 4 || pin.len() > 8 {
        return Err(DeskError::validation("PIN must be 4 to 8 digits"));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(DeskError::validation("PIN must contain only digits"));
    }
    let hash = bcrypt::hash(pin.as_str(), PIN_HASH_COST)
        .map_err(|e| DeskError::Internal(format!("Failed to hash PIN: {e}")))?;
    db.with_conn(|conn| db::set_setting(conn, "staff", role.pin_key(), &hash))?;
    info!(role = ?role, "PIN set");
    Ok(())
}

// ---------------------------------------------------------------------------
// Lockout helpers
// ---------------------------------------------------------------------------

fn check_lockout(lockout: &LockoutEntry) -> DeskResult<()> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = Utc::now() - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            let remaining = LOCKOUT_MINUTES - elapsed.num_minutes();
            return Err(DeskError::Unauthorized(format!(
                "Too many failed attempts. Try again in {remaining} minute(s)."
            )));
        }
    }
    Ok(())
}

fn load_lockout_from_db(conn: &rusqlite::Connection) -> LockoutEntry {
    let attempts = db::get_setting(conn, "staff", LOCKOUT_ATTEMPTS_KEY)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, "staff", LOCKOUT_LAST_ATTEMPT_KEY)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    LockoutEntry {
        attempts,
        last_attempt,
    }
}

fn persist_lockout_to_db(conn: &rusqlite::Connection, lockout: &LockoutEntry) {
    let attempts = db::set_setting(
        conn,
        "staff",
        LOCKOUT_ATTEMPTS_KEY,
        &lockout.attempts.to_string(),
    );
    let last = db::set_setting(
        conn,
        "staff",
        LOCKOUT_LAST_ATTEMPT_KEY,
        &lockout.last_attempt.to_rfc3339(),
    );
    if let Err(e) = attempts.and(last) {
        warn!(error = %e, "failed to persist lockout state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockout_attempts(db_state: &DbState) -> u32 {
        let conn = db_state.conn.lock().expect("db lock");
        db::get_setting(&conn, "staff", LOCKOUT_ATTEMPTS_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    }

    #[test]
    fn sign_in_validate_sign_out_lifecycle() {
        let db_state = db::test_state();
        set_pin(&db_state, Role::Staff, "2468").unwrap();
        let auth = AuthState::new();

        let session = auth.sign_in(&db_state, "2468").expect("staff sign-in");
        assert_eq!(session.role, Role::Staff);
        assert!(session.can("take_payment"));
        assert!(session.require("refund_receipt").is_err());

        let validated = auth.validate(&session.token).expect("token is live");
        assert_eq!(validated.session_id, session.session_id);

        assert!(auth.sign_out(&session.token).unwrap());
        assert!(!auth.sign_out(&session.token).unwrap());
        assert!(matches!(
            auth.validate(&session.token),
            Err(DeskError::Unauthorized(_))
        ));
    }

    #[test]
    fn admin_pin_grants_refunds() {
        let db_state = db::test_state();
        set_pin(&db_state, Role::Admin, "1234").unwrap();
        set_pin(&db_state, Role::Staff, "5678").unwrap();
        let auth = AuthState::new();
        let admin = auth.sign_in(&db_state, "1234").unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(admin.require("refund_receipt").is_ok());
        assert_eq!(auth.sign_out_all().unwrap(), 1);
    }

    #[test]
    fn set_pin_rejects_bad_pins() {
        let db_state = db::test_state();
        assert!(set_pin(&db_state, Role::Admin, "12").is_err());
        assert!(set_pin(&db_state, Role::Admin, "12ab").is_err());
        assert!(set_pin(&db_state, Role::Admin, "123456789").is_err());
    }

    #[test]
    fn lockout_persists_across_auth_state_restart() {
        let db_state = db::test_state();
        let before_restart = AuthState::new();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = before_restart
                .sign_in(&db_state, "9999")
                .expect_err("invalid sign-in should fail");
            assert_eq!(err.to_string(), "Invalid PIN");
        }
        assert_eq!(lockout_attempts(&db_state), MAX_FAILED_ATTEMPTS);

        let after_restart = AuthState::new();
        let err = after_restart
            .sign_in(&db_state, "9999")
            .expect_err("lockout should remain active after restart");
        assert!(
            err.to_string().contains("Too many failed attempts"),
            "unexpected lockout error message: {err}"
        );
        assert_eq!(lockout_attempts(&db_state), MAX_FAILED_ATTEMPTS);
    }

    #[test]
    fn successful_sign_in_resets_lockout() {
        let db_state = db::test_state();
        set_pin(&db_state, Role::Admin, "1234").unwrap();
        let auth = AuthState::new();
        for _ in 0..2 {
            auth.sign_in(&db_state, "9999").unwrap_err();
        }
        assert_eq!(lockout_attempts(&db_state), 2);
        auth.sign_in(&db_state, "1234").unwrap();
        assert_eq!(lockout_attempts(&db_state), 0);
    }

    #[test]
    fn session_debug_masks_token() {
        let auth = AuthState::new();
        let session = auth.open_session(Role::Staff);
        let rendered = format!("{session:?}");
        assert!(!rendered.contains(session.token.as_str()));
    }

    #[test]
    fn pin_verification_does_not_hold_the_database() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let db_state = Arc::new(db::test_state());
        // A slow hash so the check outlasts the sleep below.
        let hash = bcrypt::hash("1234", 12).unwrap();
        db_state
            .with_conn(|conn| db::set_setting(conn, "staff", Role::Admin.pin_key(), &hash))
            .unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let worker = {
            let db_state = db_state.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let session = AuthState::new().sign_in(&db_state, "1234");
                finished.store(true, Ordering::SeqCst);
                session
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        let conn = db_state.conn.lock().unwrap();
        assert!(!finished.load(Ordering::SeqCst), "sign-in kept the connection locked");
        drop(conn);

        let session = worker.join().unwrap().unwrap();
        assert_eq!(session.role, Role::Admin);
    }
}
