use async_trait::async_trait;
use clap::Parser;
use gateway::config::SseConfig;
use gateway::platform::{
    InboundSink, MessageService, PlatformChannel, PlatformError, PlatformMessage, PlatformUser,
};
use gateway::timer::jobs::JobStore;
use gateway::timer::oneshot::OneShotTimerService;
use gateway::timer::recurring::RecurringTimerEngine;
use gateway::timer::workday::WorkdayOracle;
use gateway::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "SSE bridge and timer engines")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Directory for the job store, timer file and holiday cache.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Access key gating the HTTP surface (unset = open).
    #[arg(long, env = "ACCESS_KEY")]
    access_key: Option<String>,

    /// Correlation-slot timeout in seconds.
    #[arg(long, env = "RESPONSE_TIMEOUT", default_value_t = 30.0)]
    response_timeout: f64,

    /// Fire-and-forget mode: do not wait for client acknowledgements.
    #[arg(long, env = "IGNORE_RESPONSE")]
    ignore_response: bool,
}

/// Stand-in collaborators for running the bridge without an agent core:
/// inbound messages and system pushes are logged, nothing more.
struct LoggingCollaborators;

#[async_trait]
impl MessageService for LoggingCollaborators {
    async fn push_system_message(
        &self,
        chat_key: &str,
        content: &str,
        trigger_agent: bool,
    ) -> Result<(), PlatformError> {
        info!(chat_key, trigger_agent, content, "system message");
        Ok(())
    }

    async fn schedule_agent_task(&self, chat_key: &str) -> Result<(), PlatformError> {
        info!(chat_key, "agent task scheduled");
        Ok(())
    }
}

#[async_trait]
impl InboundSink for LoggingCollaborators {
    async fn collect_message(
        &self,
        channel: PlatformChannel,
        user: PlatformUser,
        message: PlatformMessage,
    ) -> Result<(), PlatformError> {
        info!(
            channel_id = %channel.channel_id,
            user_id = %user.user_id,
            text = %message.content_text,
            "inbound message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir).expect("data dir must be creatable");

    let collaborators = Arc::new(LoggingCollaborators);
    let messages: Arc<dyn MessageService> = collaborators.clone();

    let config = SseConfig {
        access_key: args.access_key,
        response_timeout: Duration::from_secs_f64(args.response_timeout),
        ignore_response: args.ignore_response,
    };
    let state = AppState::new(config, collaborators.clone());

    let store = JobStore::open(&args.data_dir.join("recurring_jobs.sqlite"))
        .expect("job store must open");
    let oracle = WorkdayOracle::new(args.data_dir.join("cn_holiday"));
    let recurring = RecurringTimerEngine::new(Arc::new(Mutex::new(store)), oracle, messages.clone());
    let oneshot = OneShotTimerService::new(args.data_dir.join("oneshot_timers.json"), messages);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = state.registry.spawn_sweeper(shutdown_rx.clone());
    let recurring_task = recurring.start(shutdown_rx.clone()).await;
    let oneshot_task = oneshot.start(shutdown_rx.clone()).await;

    let router = axum::Router::new().nest("/api/adapters/sse", gateway::build_router(state));
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .expect("failed to bind");
    info!(addr = %args.bind, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Cooperative teardown: flag the stop, signal wakeups, join the loops.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, recurring_task, oneshot_task);
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
