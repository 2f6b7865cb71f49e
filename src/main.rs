//! Server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use durable_streams_server::storage::{MemoryBackend, StorageBackend};
use durable_streams_server::{create_router, AppState, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "durable-streams-server", about = "Durable Streams protocol server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DURABLE_STREAMS_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "DURABLE_STREAMS_PORT", default_value_t = 4437)]
    port: u16,

    /// Storage directory. Omit to keep all data in memory.
    #[arg(long, env = "DURABLE_STREAMS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Long-poll wait in seconds.
    #[arg(long, env = "DURABLE_STREAMS_LONG_POLL_TIMEOUT", default_value_t = 30)]
    long_poll_timeout: u64,

    /// SSE heartbeat interval in seconds.
    #[arg(long, env = "DURABLE_STREAMS_SSE_HEARTBEAT", default_value_t = 30)]
    sse_heartbeat: u64,

    /// Maximum single message size in bytes.
    #[arg(long, env = "DURABLE_STREAMS_MAX_MESSAGE_BYTES", default_value_t = 4 * 1024 * 1024)]
    max_message_bytes: usize,

    /// Maximum append request body size in bytes.
    #[arg(long, env = "DURABLE_STREAMS_MAX_BATCH_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_batch_bytes: usize,

    /// Producer fence retention in seconds.
    #[arg(long, env = "DURABLE_STREAMS_PRODUCER_STATE_TTL", default_value_t = 7 * 24 * 60 * 60)]
    producer_state_ttl: u64,

    /// Per-attempt webhook delivery timeout in seconds.
    #[arg(long, env = "DURABLE_STREAMS_WEBHOOK_TIMEOUT", default_value_t = 10)]
    webhook_timeout: u64,

    /// Allow POST to create missing streams.
    #[arg(long, env = "DURABLE_STREAMS_CREATE_ON_APPEND")]
    create_on_append: bool,
}

impl Args {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            data_dir: self.data_dir.clone(),
            long_poll_timeout: Duration::from_secs(self.long_poll_timeout),
            sse_heartbeat: Duration::from_secs(self.sse_heartbeat),
            max_message_bytes: self.max_message_bytes,
            max_batch_bytes: self.max_batch_bytes,
            producer_state_ttl: Duration::from_secs(self.producer_state_ttl),
            webhook_delivery_timeout: Duration::from_secs(self.webhook_timeout),
            create_on_append: self.create_on_append,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.to_config();

    let backend: Arc<dyn StorageBackend> = match &config.data_dir {
        #[cfg(feature = "fjall")]
        Some(dir) => {
            info!(dir = %dir.display(), "opening fjall keyspace");
            Arc::new(durable_streams_server::storage::FjallBackend::open(dir)?)
        }
        #[cfg(not(feature = "fjall"))]
        Some(_) => {
            return Err("built without the `fjall` feature; --data-dir is unavailable".into());
        }
        None => {
            info!("no data dir configured, running in-memory");
            Arc::new(MemoryBackend::new())
        }
    };

    let state = AppState::new(backend, config);
    state.webhooks.load()?;
    let router = create_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "durable streams server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
