//! Environment-driven configuration
//!
//! Every knob of the proxy comes from environment variables so that the same
//! binary can run as the supervisor, as a worker, or inside a container
//! without a config file. `NODE_ENV` only selects defaults; explicit
//! variables always win.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default ACME directory (Let's Encrypt production).
///
/// Staging is deliberately not the default: staging certificates are not
/// trusted by browsers and would turn every handshake into a warning page.
pub const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Deployment mode, selected by `NODE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEnv {
    Development,
    Production,
}

impl RunEnv {
    fn from_env() -> Self {
        match std::env::var("NODE_ENV").as_deref() {
            Ok("development") => RunEnv::Development,
            _ => RunEnv::Production,
        }
    }
}

/// Resolved runtime configuration shared by all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Deployment mode (defaults only, never behavior).
    pub env: RunEnv,
    /// Plain HTTP listener port.
    pub http_port: u16,
    /// TLS listener port.
    pub https_port: u16,
    /// Whether the TLS listener is started at all.
    pub enable_https: bool,
    /// Path of the mapping database file.
    pub db_path: PathBuf,
    /// Directory holding certificates, the ACME account and challenge files.
    pub certs_dir: PathBuf,
    /// ACME directory endpoint.
    pub acme_directory_url: String,
    /// Stable worker identity handed down by the supervisor.
    pub worker_id: Option<u32>,
}

impl ProxyConfig {
    /// Assemble the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let env = RunEnv::from_env();

        let (default_http, default_https) = match env {
            RunEnv::Production => (80, 443),
            RunEnv::Development => (8080, 8443),
        };

        let http_port = read_port("HTTP_PORT", default_http)?;
        let https_port = read_port("HTTPS_PORT", default_https)?;

        let enable_https = match std::env::var("ENABLE_HTTPS").as_deref() {
            Ok("true") => true,
            Ok("false") => false,
            Ok(other) => {
                return Err(Error::Config(format!(
                    "ENABLE_HTTPS must be 'true' or 'false', got '{}'",
                    other
                )));
            }
            Err(_) => env == RunEnv::Production,
        };

        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/current.db"));

        let certs_dir = std::env::var("CERTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./certs"));

        let acme_directory_url = std::env::var("ACME_DIRECTORY_URL")
            .unwrap_or_else(|_| DEFAULT_ACME_DIRECTORY.to_string());

        let worker_id = match std::env::var("WORKER_ID") {
            Ok(raw) => Some(raw.parse::<u32>().map_err(|_| {
                Error::Config(format!("WORKER_ID must be a non-negative integer, got '{}'", raw))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            env,
            http_port,
            https_port,
            enable_https,
            db_path,
            certs_dir,
            acme_directory_url,
            worker_id,
        })
    }
}

fn read_port(var: &str, default: u16) -> Result<u16> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("{} must be a port number, got '{}'", var, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state, so everything lives
    // in one test to avoid races between parallel test threads.
    #[test]
    fn test_env_defaults_and_overrides() {
        let clear = |keys: &[&str]| {
            for k in keys {
                unsafe { std::env::remove_var(k) };
            }
        };

        clear(&[
            "NODE_ENV",
            "HTTP_PORT",
            "HTTPS_PORT",
            "ENABLE_HTTPS",
            "DB_PATH",
            "CERTS_DIR",
            "ACME_DIRECTORY_URL",
            "WORKER_ID",
        ]);

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.env, RunEnv::Production);
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert!(config.enable_https);
        assert_eq!(config.db_path, PathBuf::from("./data/current.db"));
        assert_eq!(config.acme_directory_url, DEFAULT_ACME_DIRECTORY);
        assert!(config.worker_id.is_none());

        unsafe {
            std::env::set_var("NODE_ENV", "development");
            std::env::set_var("HTTP_PORT", "9080");
            std::env::set_var("WORKER_ID", "2");
        }

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.env, RunEnv::Development);
        assert_eq!(config.http_port, 9080);
        assert_eq!(config.https_port, 8443);
        assert!(!config.enable_https);
        assert_eq!(config.worker_id, Some(2));

        unsafe { std::env::set_var("ENABLE_HTTPS", "yes") };
        assert!(ProxyConfig::from_env().is_err());

        clear(&["NODE_ENV", "HTTP_PORT", "ENABLE_HTTPS", "WORKER_ID"]);
    }
}
