mod client;
mod config;
mod error;
mod metrics;
mod raft;
mod server;
mod service;
mod state_log;
mod worker;

use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    config::RuntimeConfig::from_toml("config.toml").expect("Config is missing");
    {
        server::instance().lock().await.start().await?;
    }
    shutdown_signal().await;
    {
        let mut server = server::instance().lock().await;
        server.stop();
        server.wait_until_stop().await;
    }
    Ok(())
}
