//! Coworking front desk backend.
//!
//! Clients check in and out by scanning a barcode; while present they run
//! a tab of session line items that the POS settles into a receipt. The
//! same operations are served over HTTP by [`http::router`], either against
//! the local SQLite store or, for check-in, the hosted Supabase RPC.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

pub mod auth;
pub mod checkin;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod inventory;
pub mod logging;
pub mod models;
pub mod orders;
pub mod payments;
pub mod refunds;
pub mod remote;

pub use error::{DeskError, DeskResult};

use config::{CheckinBackend, DeskConfig};

/// Build the shared HTTP state from a loaded config.
pub fn build_state(config: &DeskConfig) -> DeskResult<http::AppState> {
    let db = Arc::new(db::init(&config.data_dir)?);

    let remote = match (&config.supabase_url, &config.supabase_key) {
        (Some(url), Some(key)) => Some(Arc::new(remote::SupabaseClient::new(url, key)?)),
        _ => None,
    };
    if config.checkin_backend == CheckinBackend::Supabase && remote.is_none() {
        return Err(DeskError::validation(
            "Supabase check-in backend selected without credentials",
        ));
    }

    Ok(http::AppState {
        db,
        auth: Arc::new(auth::AuthState::new()),
        remote,
        backend: config.checkin_backend,
    })
}

/// Process entry point: config, logging, database, then serve until
/// Ctrl-C / SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let config = DeskConfig::from_env().context("invalid configuration")?;
    let _guard = logging::init_tracing(&config);
    info!(version = env!("CARGO_PKG_VERSION"), ?config, "Starting coworking desk");

    let state = build_state(&config).context("startup failed")?;
    if let Some(remote) = &state.remote {
        let reach = remote.test_connectivity().await;
        if reach.success {
            info!(url = remote.base_url(), latency_ms = ?reach.latency_ms, "Supabase reachable");
        } else {
            warn!(url = remote.base_url(), error = reach.error.as_deref().unwrap_or("-"), "Supabase unreachable");
        }
    }

    let auth = state.auth.clone();
    let app = http::router(state, &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| {
            error!(addr = %config.bind_addr, "Failed to bind: {e} - is another instance running?");
            e
        })?;
    info!(addr = %config.bind_addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    match auth.sign_out_all() {
        Ok(count) => info!(sessions = count, "Shut down, sessions cleared"),
        Err(e) => warn!(error = %e, "Failed to clear sessions on shutdown"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_build_state_local() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();
        let env: HashMap<&str, String> = HashMap::from([("DESK_DATA_DIR", data_dir)]);
        let config = DeskConfig::from_lookup(|key: &str| env.get(key).cloned()).unwrap();

        let state = build_state(&config).unwrap();
        assert!(state.remote.is_none());
        assert_eq!(state.backend, CheckinBackend::Local);
        assert!(dir.path().join("desk.db").exists());
    }

    #[test]
    fn test_build_state_with_supabase() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<&str, String> = HashMap::from([
            ("DESK_DATA_DIR", dir.path().to_string_lossy().into_owned()),
            ("DESK_CHECKIN_BACKEND", "supabase".to_string()),
            ("SUPABASE_URL", "abcdefgh.supabase.co".to_string()),
            ("SUPABASE_SERVICE_ROLE_KEY", "service-key".to_string()),
        ]);
        let config = DeskConfig::from_lookup(|key: &str| env.get(key).cloned()).unwrap();

        let state = build_state(&config).unwrap();
        let remote = state.remote.expect("remote client");
        assert_eq!(remote.base_url(), "https://abcdefgh.supabase.co");
        assert_eq!(state.backend, CheckinBackend::Supabase);
    }
}
