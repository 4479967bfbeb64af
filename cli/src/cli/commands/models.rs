use llm_alias_core::config::Config;

use crate::cli::{open_manager, ModelCommands};

pub async fn run(config: Config, command: ModelCommands) -> anyhow::Result<()> {
    let manager = open_manager(config)?;

    match command {
        ModelCommands::List => {
            let models = manager.get_models()?;
            if models.is_empty() {
                println!("No models registered.");
                return Ok(());
            }

            println!("{:<38} {:<20} {:<30} {:<40}", "ID", "ALIAS", "REAL MODEL", "URL");
            println!("{}", "-".repeat(130));
            for model in models {
                let alias = if model.is_default {
                    format!("{} *", model.alias)
                } else {
                    model.alias
                };
                println!("{:<38} {:<20} {:<30} {:<40}", model.id, alias, model.real_model, model.url);
            }
        }
        ModelCommands::Add { alias, url, real_model, default } => {
            let id = manager.add_model(&alias, &url, &real_model, default)?;
            println!("Model {} added ({})", alias, id);
        }
        ModelCommands::Update { id, alias, url, real_model, default, no_default } => {
            let current = manager
                .registry()
                .get(&id)?
                .ok_or_else(|| anyhow::anyhow!("Model with ID {} not found", id))?;

            let is_default = match (default, no_default) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };

            let outcome = manager
                .update_model(
                    &id,
                    alias.as_deref().unwrap_or(&current.alias),
                    url.as_deref().unwrap_or(&current.url),
                    real_model.as_deref().unwrap_or(&current.real_model),
                    is_default,
                )
                .await?;
            println!("Model {} updated", outcome.model.alias);
        }
        ModelCommands::Remove { id } => {
            let removed = manager.remove_model(&id).await?;
            println!("Model {} deleted", removed.alias);
        }
        ModelCommands::SetDefault { id } => {
            manager.set_default(&id)?;
            println!("Default model set to {}", id);
        }
    }

    Ok(())
}
