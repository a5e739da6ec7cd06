// src/main.rs
use std::sync::atomic::Ordering;
use std::sync::Arc;

use satie::logger::level_filter;
use satie::{Config, Logger, PgUserStore, SatieResult, Server};

fn main() {
    if let Err(e) = run() {
        eprintln!("satie failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> SatieResult<()> {
    let cfg = Config::from_env();

    let mut logger = None;
    if cfg.log_enabled {
        let l = Logger::init(
            &cfg.log_dir,
            ".log",
            level_filter(cfg.log_level),
            50_000,
            cfg.log_queue_capacity,
        )?;
        l.install()?;
        logger = Some(l);
    }

    log::info!("========== satie starting ==========");
    log::info!(
        "port {}, trigger mode {}, idle timeout {} ms",
        cfg.listen_port,
        cfg.trigger_mode,
        cfg.idle_timeout_ms
    );

    let store = Arc::new(PgUserStore::connect(&cfg.sql_config(), cfg.sql_pool_size)?);
    let mut server = Server::new(&cfg, store)?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        // The signal interrupts epoll_wait; the loop sees the flag and exits.
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|e| satie::SatieError::Fatal(e.to_string()))?;

    let result = server.run();

    if let Some(mut l) = logger.take() {
        l.shutdown();
    }
    result
}
