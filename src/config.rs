//! Process configuration read from the environment (and `.env`).
//!
//! | Variable                    | Default            |
//! |-----------------------------|--------------------|
//! | `DESK_DATA_DIR`             | `./data`           |
//! | `DESK_BIND_ADDR`            | `127.0.0.1:8787`   |
//! | `DESK_LOG_DIR`              | `{data_dir}/logs`  |
//! | `DESK_LOG_FORMAT`           | `text` (`json`)    |
//! | `DESK_ALLOWED_ORIGINS`      | any origin         |
//! | `DESK_CHECKIN_BACKEND`      | `local` (`supabase`) |
//! | `SUPABASE_URL`              | unset              |
//! | `SUPABASE_SERVICE_ROLE_KEY` | falls back to `SUPABASE_ANON_KEY` |

use std::net::SocketAddr;
use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::error::{DeskError, DeskResult};

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where check-in scans are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinBackend {
    /// Local SQLite database.
    Local,
    /// Forward to the hosted `toggle_client_checkin_status` RPC.
    Supabase,
}

#[derive(Clone)]
pub struct DeskConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub log_dir: PathBuf,
    pub log_format: LogFormat,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub checkin_backend: CheckinBackend,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for DeskConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeskConfig")
            .field("data_dir", &self.data_dir)
            .field("bind_addr", &self.bind_addr)
            .field("log_dir", &self.log_dir)
            .field("log_format", &self.log_format)
            .field("allowed_origins", &self.allowed_origins)
            .field("checkin_backend", &self.checkin_backend)
            .field("supabase_url", &self.supabase_url)
            .field("supabase_key", &self.supabase_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl DeskConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> DeskResult<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DeskResult<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = PathBuf::from(get("DESK_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into()));
        let bind_raw = get("DESK_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| DeskError::validation(format!("Invalid DESK_BIND_ADDR {bind_raw}: {e}")))?;
        let log_dir = get("DESK_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        let log_format = match get("DESK_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(DeskError::validation(format!(
                    "Invalid DESK_LOG_FORMAT: {other}. Must be text or json"
                )))
            }
        };

        let allowed_origins = get("DESK_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let supabase_url = get("SUPABASE_URL");
        let supabase_key = get("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| get("SUPABASE_ANON_KEY"))
            .map(Zeroizing::new);

        let checkin_backend = match get("DESK_CHECKIN_BACKEND").as_deref() {
            None | Some("local") => CheckinBackend::Local,
            Some("supabase") => {
                if supabase_url.is_none() || supabase_key.is_none() {
                    return Err(DeskError::validation(
                        "DESK_CHECKIN_BACKEND=supabase requires SUPABASE_URL and a Supabase key",
                    ));
                }
                CheckinBackend::Supabase
            }
            Some(other) => {
                return Err(DeskError::validation(format!(
                    "Invalid DESK_CHECKIN_BACKEND: {other}. Must be local or supabase"
                )))
            }
        };

        Ok(Self {
            data_dir,
            bind_addr,
            log_dir,
            log_format,
            allowed_origins,
            checkin_backend,
            supabase_url,
            supabase_key,
        })
    }
}
