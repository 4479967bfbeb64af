pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use llm_alias_core::config::{expand_path, Config};
use llm_alias_core::store::JsonFileStore;
use llm_alias_core::ProxyManager;

#[derive(Parser)]
#[command(name = "llm-alias-proxy")]
#[command(author, version, about = "Expose upstream LLM backends under stable local aliases")]
pub struct Cli {
    /// Path to config file (checked in order: local config.toml, ~/.config/llm-alias-proxy/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start proxies and serve until Ctrl+C
    Start {
        /// Aliases to start (default model if omitted)
        aliases: Vec<String>,

        /// Start every registered model
        #[arg(long, conflicts_with = "aliases")]
        all: bool,
    },

    /// Manage registered models
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List all models
    List,

    /// Register a new model
    Add {
        alias: String,
        /// Backend base URL, e.g. https://api.example.com/v1
        url: String,
        /// Model name sent to the backend
        real_model: String,
        /// Make this the default model
        #[arg(long)]
        default: bool,
    },

    /// Change a model; omitted fields keep their value
    Update {
        id: String,
        #[arg(long)]
        alias: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        real_model: Option<String>,
        #[arg(long, conflicts_with = "no_default")]
        default: bool,
        #[arg(long)]
        no_default: bool,
    },

    /// Remove a model
    Remove { id: String },

    /// Make a model the default
    SetDefault { id: String },
}

/// Open the on-disk store named by the config and wire a manager around it.
pub fn open_manager(config: Config) -> anyhow::Result<ProxyManager> {
    let dir = expand_path(&config.storage.directory);
    let store = JsonFileStore::open(&dir)?;
    tracing::debug!("Using state file {:?}", store.path());
    Ok(ProxyManager::new(Arc::new(store), config)?)
}
