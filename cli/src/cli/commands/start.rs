use llm_alias_core::config::Config;
use llm_alias_core::ProxyManager;

use crate::cli::open_manager;

pub async fn run(config: Config, aliases: Vec<String>, all: bool) -> anyhow::Result<()> {
    let manager = open_manager(config)?;

    tracing::info!("Starting llm-alias-proxy...");

    let targets: Vec<String> = if all {
        manager.get_models()?.into_iter().map(|m| m.alias).collect()
    } else if !aliases.is_empty() {
        aliases
    } else {
        match manager.start_default().await? {
            Some((alias, endpoint)) => {
                print_started(&manager, &alias, &endpoint.local_url)?;
                return serve_until_signal(manager).await;
            }
            None => anyhow::bail!("No alias given and no default model set"),
        }
    };

    let mut started = 0;
    for alias in &targets {
        match manager.start_proxy(alias).await {
            Ok(endpoint) => {
                started += 1;
                print_started(&manager, alias, &endpoint.local_url)?;
            }
            Err(e) => {
                tracing::error!(alias = %alias, kind = e.kind(), "Failed to start proxy: {}", e);
            }
        }
    }

    if started == 0 {
        manager.shutdown().await;
        anyhow::bail!("No proxy could be started");
    }

    serve_until_signal(manager).await
}

fn print_started(manager: &ProxyManager, alias: &str, local_url: &str) -> anyhow::Result<()> {
    let real_model = manager
        .registry()
        .get_by_alias(alias)?
        .map(|m| m.real_model)
        .unwrap_or_default();
    println!("Proxy started for {}", alias);
    println!("  URL:   {}", local_url);
    println!("  Model: {}", real_model);
    Ok(())
}

async fn serve_until_signal(manager: ProxyManager) -> anyhow::Result<()> {
    tracing::info!("Press Ctrl+C to stop");
    shutdown_signal().await;

    manager.shutdown().await;
    tracing::info!("All proxies stopped");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}
