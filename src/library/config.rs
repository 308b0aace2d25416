use clap::Parser;
use std::path::PathBuf;

/// Execution model for connection events, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Reactor,
    Proactor,
}

/// Server configuration. Short flags mirror the historical getopt surface
/// (`-p` port, `-m` trigger combo, `-a` actor model, ...).
#[derive(Debug, Clone, Parser)]
#[command(name = "muon")]
#[command(about = "epoll-driven HTTP/1.1 file server with reactor/proactor dispatch")]
#[command(version)]
pub struct Config {
    /// Listening port
    #[arg(short = 'p', long, default_value_t = 9006)]
    pub port: u16,

    /// Route log lines through the asynchronous bounded queue
    #[arg(short = 'l', long = "async-log")]
    pub async_log: bool,

    /// Trigger combo 0..=3: bit 0 = edge-triggered connections,
    /// bit 1 = edge-triggered listener
    #[arg(short = 'm', long = "trig-mode", default_value_t = 0)]
    pub trig_mode: u8,

    /// Linger on close, flushing unsent bytes for up to a second
    #[arg(short = 'o', long)]
    pub linger: bool,

    /// Credential-store pool size
    #[arg(short = 's', long = "pool-size", default_value_t = 8)]
    pub pool_size: usize,

    /// Worker threads; 0 picks one per CPU
    #[arg(short = 't', long, default_value_t = 0)]
    pub threads: usize,

    /// Log warnings and errors only
    #[arg(short = 'c', long)]
    pub quiet: bool,

    /// Actor model: 1 = reactor, 0 = proactor
    #[arg(short = 'a', long = "actor", default_value_t = 0)]
    pub actor_model: u8,

    /// Document root served to clients
    #[arg(short = 'r', long = "root", default_value = "./root")]
    pub doc_root: PathBuf,

    /// Credential table backing file
    #[arg(long = "users", default_value = "./users.json")]
    pub user_store: PathBuf,

    /// Idle sweep interval in seconds; connections idle for three ticks
    /// are evicted
    #[arg(long = "tick", default_value_t = 5)]
    pub tick_secs: u64,

    /// Active-connection cap; arrivals beyond it get the busy response
    #[arg(long = "max-conns", default_value_t = 65536)]
    pub max_connections: usize,

    /// Worker task queue capacity
    #[arg(long = "queue", default_value_t = 10000)]
    pub queue_capacity: usize,

    /// Async log queue capacity
    #[arg(long = "log-queue", default_value_t = 8192)]
    pub log_queue_capacity: usize,
}

impl Config {
    pub fn listen_edge_triggered(&self) -> bool {
        (self.trig_mode >> 1) & 1 == 1
    }

    pub fn conn_edge_triggered(&self) -> bool {
        self.trig_mode & 1 == 1
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        if self.actor_model == 1 {
            DispatchMode::Reactor
        } else {
            DispatchMode::Proactor
        }
    }

    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }
}
