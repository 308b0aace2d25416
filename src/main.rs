use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::Context as _;
use clap::Parser;
use muon::library::{config::Config, db::Context, logsink::AsyncSink, server::Server};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt;

fn bootstrap_logs(cfg: &Config) -> anyhow::Result<()> {
    let level = if cfg.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    if cfg.async_log {
        let sink = AsyncSink::new(cfg.log_queue_capacity)?;
        fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_target(false)
            .compact()
            .with_ansi(false)
            .with_writer(sink)
            .init();
    } else {
        fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_target(false)
            .compact()
            .with_ansi(true)
            .init();
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();
    bootstrap_logs(&cfg)?;

    let ctx = Arc::new(Context::new(
        cfg.doc_root.clone(),
        cfg.user_store.clone(),
        cfg.pool_size,
    ));
    ctx.preload().context("loading the credential table")?;

    let server = Server::bind(&cfg, ctx).context("binding the server")?;
    info!(
        "serving {} on {}",
        cfg.doc_root.display(),
        server.local_addr()?
    );
    server.run().context("event loop failed")?;
    Ok(())
}
