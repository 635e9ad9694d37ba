use crate::settings::{Language, Theme, TriggerMode};
use clap::{Parser, Subcommand};
use llm::chatgpt::FeedbackRating;
use llm::ProviderKind;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask a question and stream the answer to stdout
    Ask {
        /// The search query
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Provider to use instead of the configured one
        #[arg(short = 'p', long)]
        provider: Option<ProviderKind>,

        /// Ask even if the trigger mode would skip this query
        #[arg(short, long)]
        force: bool,

        /// After a login or security check failure, retry once Enter is pressed
        #[arg(long)]
        retry_on_resume: bool,
    },

    /// Rate an answer from the ChatGPT webapp
    Feedback {
        #[arg(long)]
        message_id: String,

        #[arg(long)]
        conversation_id: String,

        #[arg(long, value_enum)]
        rating: FeedbackRating,
    },

    /// Show or change the stored configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the stored configuration (API keys masked)
    Show,

    /// Select a provider and update its settings
    SetProvider {
        kind: ProviderKind,

        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Endpoint base URL
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Update user preferences
    SetUser {
        #[arg(long)]
        language: Option<Language>,

        #[arg(long)]
        theme: Option<Theme>,

        #[arg(long)]
        trigger_mode: Option<TriggerMode>,
    },
}

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Directory holding config.json
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,
}

impl Args {
    pub fn parse() -> Self {
        <Args as Parser>::parse()
    }
}
