//! Minimal runnable demonstration of wiring a [`ChangeTailer`] over a real
//! Postgres connection using the `tokio-postgres-adapter` reference
//! [`DbPool`]. Not part of the library's public contract — packaging and a
//! real CLI are out of scope for this crate (spec §1); this only exists so
//! the wiring in this file's doc comment has somewhere to actually run.
//!
//! ```text
//! cargo run --features tokio-postgres-adapter --bin tail-demo -- \
//!     "host=localhost user=postgres dbname=app" widgets
//! ```

use std::env;
use std::sync::Arc;

use pg_reactive_stream::db::tokio_postgres_adapter::PgPool;
use pg_reactive_stream::{ChangeEvent, ChangeObserver, ChangeTailer, StreamConfig};
use tracing_subscriber::{EnvFilter, fmt};

struct StdoutPrinter;

impl ChangeObserver for StdoutPrinter {
    fn on_next(&self, event: &ChangeEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize change event"),
        }
    }

    fn on_complete(&self) {
        tracing::info!("change stream completed");
    }

    fn on_error(&self, err: &Arc<pg_reactive_stream::ReplicationError>) {
        tracing::error!(error = %err, "change stream errored");
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let mut args = env::args().skip(1);
    let connection_string = args.next().unwrap_or_else(|| {
        eprintln!("usage: tail-demo <connection-string> <table>[,<table>...]");
        std::process::exit(1);
    });
    let tables_arg = args.next().unwrap_or_else(|| {
        eprintln!("usage: tail-demo <connection-string> <table>[,<table>...]");
        std::process::exit(1);
    });
    let tables: Vec<String> = tables_arg.split(',').map(str::to_string).collect();

    let pool = PgPool::new(connection_string);
    let config = match StreamConfig::new(tables) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let tailer = match ChangeTailer::start(&pool, config).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to start change tailer");
            std::process::exit(1);
        }
    };

    tailer.stream().subscribe(Arc::new(StdoutPrinter));

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutting down");
    tailer.teardown().await;
}
