// src/config.rs
use serde::Deserialize;

use crate::sql::SqlConfig;

/// Server configuration, loaded from environment variables (with `.env`
/// support). Every field has a default so a bare environment still runs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP listen port. 0 lets the kernel pick (tests use this).
    pub listen_port: u16,

    /// Trigger mode 0..3: bit 0 = connections edge-triggered,
    /// bit 1 = listener edge-triggered.
    pub trigger_mode: u8,

    /// Idle-connection timeout in milliseconds; 0 disables eviction.
    pub idle_timeout_ms: u64,

    /// Enable SO_LINGER on the listener.
    pub so_linger: bool,

    /// Static content root, concatenated with request paths.
    pub src_dir: String,

    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_pwd: String,
    pub sql_db: String,
    pub sql_pool_size: usize,

    /// Worker thread count; 0 means one per CPU.
    pub worker_threads: usize,

    pub log_enabled: bool,
    /// 0 = debug, 1 = info, 2 = warn, 3 = error.
    pub log_level: u8,
    /// Async log queue capacity; 0 switches the log to synchronous writes.
    pub log_queue_capacity: usize,
    pub log_dir: String,
}

impl Config {
    /// Load from environment variables, reading `.env` first if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Config {
            listen_port: env_parse("SATIE_PORT", 1316),
            trigger_mode: env_parse("SATIE_TRIGGER_MODE", 3),
            idle_timeout_ms: env_parse("SATIE_IDLE_TIMEOUT_MS", 60_000),
            so_linger: env_parse("SATIE_SO_LINGER", false),
            src_dir: std::env::var("SATIE_SRC_DIR")
                .unwrap_or_else(|_| "./resources".to_string()),
            sql_host: std::env::var("SATIE_SQL_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            sql_port: env_parse("SATIE_SQL_PORT", 5432),
            sql_user: std::env::var("SATIE_SQL_USER")
                .unwrap_or_else(|_| "postgres".to_string()),
            sql_pwd: std::env::var("SATIE_SQL_PWD").unwrap_or_default(),
            sql_db: std::env::var("SATIE_SQL_DB").unwrap_or_else(|_| "satie".to_string()),
            sql_pool_size: env_parse("SATIE_SQL_POOL_SIZE", 8),
            worker_threads: env_parse("SATIE_WORKER_THREADS", 8),
            log_enabled: env_parse("SATIE_LOG_ENABLED", true),
            log_level: env_parse("SATIE_LOG_LEVEL", 1),
            log_queue_capacity: env_parse("SATIE_LOG_QUEUE_CAPACITY", 1024),
            log_dir: std::env::var("SATIE_LOG_DIR").unwrap_or_else(|_| "./log".to_string()),
        }
    }

    pub fn conn_edge_triggered(&self) -> bool {
        self.trigger_mode & 0b01 != 0
    }

    pub fn listener_edge_triggered(&self) -> bool {
        self.trigger_mode & 0b10 != 0
    }

    /// Effective worker count (0 resolves to the CPU count).
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    pub fn sql_config(&self) -> SqlConfig {
        SqlConfig {
            host: self.sql_host.clone(),
            port: self.sql_port,
            user: self.sql_user.clone(),
            password: self.sql_pwd.clone(),
            database: self.sql_db.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; no environment reads, so tests stay hermetic.
        Config {
            listen_port: 1316,
            trigger_mode: 3,
            idle_timeout_ms: 60_000,
            so_linger: false,
            src_dir: "./resources".to_string(),
            sql_host: "127.0.0.1".to_string(),
            sql_port: 5432,
            sql_user: "postgres".to_string(),
            sql_pwd: String::new(),
            sql_db: "satie".to_string(),
            sql_pool_size: 8,
            worker_threads: 8,
            log_enabled: true,
            log_level: 1,
            log_queue_capacity: 1024,
            log_dir: "./log".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
