use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use llm_alias_core::config::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let loaded = load_config(cli.config.clone())?;

    // Initialize logging
    let level = &loaded.config.logging.level;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("llm_alias_proxy={}", level).parse()?)
                .add_directive(format!("llm_alias_core={}", level).parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    loaded.log_source();
    let config = loaded.config;

    match cli.command {
        Commands::Start { aliases, all } => {
            cli::commands::start::run(config, aliases, all).await?;
        }
        Commands::Models { command } => {
            cli::commands::models::run(config, command).await?;
        }
    }

    Ok(())
}
