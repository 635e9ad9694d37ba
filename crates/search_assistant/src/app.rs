use crate::prompt::{self, ErrorHint};
use crate::session::{AnswerSessionManager, SessionEvents};
use crate::settings::{ConfigStore, Language, Theme, TriggerMode};
use anyhow::{bail, Result};
use llm::chatgpt::{self, FeedbackRating};
use llm::{
    AccessTokenCache, Answer, AnswerEvent, ApiCredentials, DirectFetchProxy, FetchProxy,
    ProviderConfigs, ProviderFactory, ProviderKind,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Network collaborators shared by all sessions of one process
struct Services {
    proxy: Arc<dyn FetchProxy>,
    token_cache: Arc<AccessTokenCache>,
}

impl Services {
    fn new(configs: &ProviderConfigs) -> Self {
        let proxy: Arc<dyn FetchProxy> = Arc::new(DirectFetchProxy::new());
        let token_cache = Arc::new(AccessTokenCache::new(
            proxy.clone(),
            &configs.session_base_url(),
        ));
        Self { proxy, token_cache }
    }
}

pub async fn ask(
    store: Arc<dyn ConfigStore>,
    question: &str,
    provider: Option<ProviderKind>,
    force: bool,
    retry_on_resume: bool,
) -> Result<()> {
    let user_config = store.user_config()?;
    if !prompt::should_query(question, user_config.trigger_mode, force) {
        println!(
            "Trigger mode is {:?}, not asking. Pass --force to ask anyway.",
            user_config.trigger_mode
        );
        return Ok(());
    }

    let services = Services::new(&store.provider_configs()?);
    let factory = Arc::new(ProviderFactory::new(
        services.token_cache.clone(),
        services.proxy.clone(),
    ));
    let mut manager =
        AnswerSessionManager::new(factory, store).with_token_cache(services.token_cache.clone());

    let mut receiver = manager.start_session(question, provider);
    let mut outcome = render_answer(&mut receiver).await?;

    if retry_on_resume {
        while outcome
            .as_ref()
            .is_some_and(|failure| failure.kind.is_some_and(|kind| kind.is_reauthorizable()))
        {
            println!("Press Enter to retry once you are logged in...");
            if !wait_for_enter().await? {
                break;
            }
            let Some(mut retried) = manager.resume() else {
                break;
            };
            outcome = render_answer(&mut retried).await?;
        }
    }

    // Hide a webapp conversation before exiting
    if let Some(cleanup) = manager.cancel_session() {
        if let Err(e) = cleanup.await {
            warn!("Session cleanup failed: {}", e);
        }
    }

    if outcome.is_some() {
        // Error and hint are already on stderr
        std::process::exit(1);
    }
    Ok(())
}

struct Failure {
    kind: Option<llm::ErrorKind>,
}

/// Print answer snapshots as they grow. Returns the terminal error, if any.
async fn render_answer(receiver: &mut SessionEvents) -> Result<Option<Failure>> {
    let mut printed = 0;
    let mut last = Answer::default();
    let mut stdout = std::io::stdout();

    while let Some(event) = receiver.recv().await {
        match event {
            AnswerEvent::Answer(answer) => {
                // Snapshots only ever append
                if let Some(delta) = answer.text.get(printed..) {
                    write!(stdout, "{delta}")?;
                    stdout.flush()?;
                }
                printed = answer.text.len();
                last = answer;
            }
            AnswerEvent::Done => {
                writeln!(stdout)?;
                if let Some(ids) = feedback_ids(&last) {
                    eprintln!("{ids}");
                }
                return Ok(None);
            }
            AnswerEvent::Error { message, kind } => {
                if printed > 0 {
                    writeln!(stdout)?;
                }
                eprintln!("Error: {message}");
                eprintln!("{}", ErrorHint::classify(&message, kind).message());
                return Ok(Some(Failure { kind }));
            }
        }
    }

    Ok(None)
}

/// Ids to pass to the `feedback` subcommand
fn feedback_ids(answer: &Answer) -> Option<String> {
    let message_id = answer.message_id.as_deref()?;
    let conversation_id = answer.conversation_id.as_deref()?;
    Some(format!(
        "--message-id {message_id} --conversation-id {conversation_id}"
    ))
}

async fn wait_for_enter() -> Result<bool> {
    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(read > 0)
}

pub async fn feedback(
    store: Arc<dyn ConfigStore>,
    message_id: &str,
    conversation_id: &str,
    rating: FeedbackRating,
) -> Result<()> {
    let configs = store.provider_configs()?;
    let services = Services::new(&configs);
    let token = services.token_cache.get_access_token().await?;

    chatgpt::send_message_feedback(
        services.proxy.as_ref(),
        &configs.session_base_url(),
        &token,
        message_id,
        conversation_id,
        rating,
    )
    .await?;
    println!("Feedback sent.");
    Ok(())
}

pub fn show_config(store: &dyn ConfigStore) -> Result<()> {
    let mut configs = store.provider_configs()?;
    for credentials in [&mut configs.openai, &mut configs.gemini] {
        if let Some(api_key) = &mut credentials.api_key {
            *api_key = mask_api_key(api_key);
        }
    }

    let shown = serde_json::json!({
        "providers": configs,
        "user": store.user_config()?,
    });
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

pub fn set_provider(
    store: &dyn ConfigStore,
    kind: ProviderKind,
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
) -> Result<()> {
    let mut configs = store.provider_configs()?;
    configs.provider = kind;

    match kind {
        ProviderKind::ChatGpt => {
            if api_key.is_some() || model.is_some() {
                bail!("The chatgpt provider uses the webapp session and takes no API key or model");
            }
            if base_url.is_some() {
                configs.chatgpt.base_url = base_url;
            }
        }
        ProviderKind::OpenAI => update_credentials(&mut configs.openai, api_key, model, base_url),
        ProviderKind::Gemini => update_credentials(&mut configs.gemini, api_key, model, base_url),
    }

    // Surface missing settings now rather than on the next question
    if let Err(e) = configs.resolve(None) {
        eprintln!("Warning: {e}");
    }

    store.save_provider_configs(&configs)
}

fn update_credentials(
    credentials: &mut ApiCredentials,
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
) {
    if api_key.is_some() {
        credentials.api_key = api_key;
    }
    if model.is_some() {
        credentials.model = model;
    }
    if base_url.is_some() {
        credentials.base_url = base_url;
    }
}

pub fn set_user(
    store: &dyn ConfigStore,
    language: Option<Language>,
    theme: Option<Theme>,
    trigger_mode: Option<TriggerMode>,
) -> Result<()> {
    let mut config = store.user_config()?;
    if let Some(language) = language {
        config.language = language;
    }
    if let Some(theme) = theme {
        config.theme = theme;
    }
    if let Some(trigger_mode) = trigger_mode {
        config.trigger_mode = trigger_mode;
    }
    store.save_user_config(&config)
}

fn mask_api_key(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
