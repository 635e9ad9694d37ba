mod app;
mod cli;
mod logging;
mod prompt;
mod session;
mod settings;

use crate::cli::{Args, Command, ConfigCommand};
use crate::settings::{ConfigStore, FileConfigStore};
use anyhow::Result;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.verbose, args.log_file);

    let store = match args.config_dir {
        Some(dir) => FileConfigStore::in_dir(&dir),
        None => FileConfigStore::default_location()?,
    };
    tracing::debug!("Using settings at {}", store.path().display());
    let store: Arc<dyn ConfigStore> = Arc::new(store);

    match args.command {
        Command::Ask {
            question,
            provider,
            force,
            retry_on_resume,
        } => app::ask(store, &question.join(" "), provider, force, retry_on_resume).await,
        Command::Feedback {
            message_id,
            conversation_id,
            rating,
        } => app::feedback(store, &message_id, &conversation_id, rating).await,
        Command::Config(ConfigCommand::Show) => app::show_config(store.as_ref()),
        Command::Config(ConfigCommand::SetProvider {
            kind,
            api_key,
            model,
            base_url,
        }) => app::set_provider(store.as_ref(), kind, api_key, model, base_url),
        Command::Config(ConfigCommand::SetUser {
            language,
            theme,
            trigger_mode,
        }) => app::set_user(store.as_ref(), language, theme, trigger_mode),
    }
}
