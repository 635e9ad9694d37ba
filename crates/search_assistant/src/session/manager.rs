use crate::prompt;
use crate::session::SessionRequest;
use crate::settings::ConfigStore;
use anyhow::Result;
use llm::{
    AccessTokenCache, AnswerEvent, Cleanup, ErrorKind, EventCallback, Provider, ProviderKind,
    ProviderResolver,
};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The running (or last finished) session
struct ActiveSession {
    request: SessionRequest,
    cancel: CancellationToken,
    handle: JoinHandle<Option<Cleanup>>,
    failure: Arc<OnceLock<ErrorKind>>,
}

/// Receiving end of one session's events.
///
/// Yields nothing more once the session is cancelled, including events the
/// provider queued before the cancellation.
pub struct SessionEvents {
    receiver: mpsc::UnboundedReceiver<AnswerEvent>,
    cancel: CancellationToken,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<AnswerEvent> {
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.receiver.recv() => event,
        };
        if event.is_none() {
            self.receiver.close();
        }
        event
    }
}

/// Owns the single answer session of one UI surface.
///
/// Starting a new session cancels the previous one first. Events of a
/// cancelled session are never delivered, even if its provider keeps
/// producing them.
pub struct AnswerSessionManager {
    resolver: Arc<dyn ProviderResolver>,
    store: Arc<dyn ConfigStore>,
    token_cache: Option<Arc<AccessTokenCache>>,
    active: Option<ActiveSession>,
}

impl AnswerSessionManager {
    pub fn new(resolver: Arc<dyn ProviderResolver>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            resolver,
            store,
            token_cache: None,
            active: None,
        }
    }

    /// Cache to invalidate when a session fails with UNAUTHORIZED or CLOUDFLARE
    pub fn with_token_cache(mut self, token_cache: Arc<AccessTokenCache>) -> Self {
        self.token_cache = Some(token_cache);
        self
    }

    pub fn start_session(
        &mut self,
        question: &str,
        provider_override: Option<ProviderKind>,
    ) -> SessionEvents {
        self.start(SessionRequest {
            question: question.to_string(),
            provider_override,
        })
    }

    fn start(&mut self, request: SessionRequest) -> SessionEvents {
        // Dropping the handle detaches the cleanup task
        let _ = self.cancel_session();

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let failure = Arc::new(OnceLock::new());

        let handle = tokio::spawn(run_session(
            self.resolver.clone(),
            self.store.clone(),
            self.token_cache.clone(),
            request.clone(),
            sender,
            cancel.clone(),
            failure.clone(),
        ));

        self.active = Some(ActiveSession {
            request,
            cancel: cancel.clone(),
            handle,
            failure,
        });
        SessionEvents { receiver, cancel }
    }

    /// Cancel the current session and run its provider cleanup.
    ///
    /// The returned handle completes once cleanup has finished.
    pub fn cancel_session(&mut self) -> Option<JoinHandle<()>> {
        let active = self.active.take()?;
        debug!("Cancelling session for '{}'", active.request.question);
        active.cancel.cancel();

        Some(tokio::spawn(async move {
            match active.handle.await {
                Ok(Some(cleanup)) => cleanup.await,
                Ok(None) => {}
                Err(e) => warn!("Answer session task failed: {}", e),
            }
        }))
    }

    /// Error kind the current session ended with, if it failed
    pub fn last_failure(&self) -> Option<ErrorKind> {
        self.active
            .as_ref()
            .and_then(|active| active.failure.get().copied())
    }

    /// Re-run the last question after an external resume signal.
    ///
    /// Only sessions that failed with a re-authorizable error are retried.
    pub fn resume(&mut self) -> Option<SessionEvents> {
        let failure = self.last_failure()?;
        if !failure.is_reauthorizable() {
            debug!("Not resuming session that failed with {:?}", failure);
            return None;
        }

        let request = self.active.as_ref()?.request.clone();
        debug!("Resuming session for '{}'", request.question);
        Some(self.start(request))
    }
}

async fn run_session(
    resolver: Arc<dyn ProviderResolver>,
    store: Arc<dyn ConfigStore>,
    token_cache: Option<Arc<AccessTokenCache>>,
    request: SessionRequest,
    sender: mpsc::UnboundedSender<AnswerEvent>,
    cancel: CancellationToken,
    failure: Arc<OnceLock<ErrorKind>>,
) -> Option<Cleanup> {
    let on_event: EventCallback = {
        let cancel = cancel.clone();
        let failure = failure.clone();
        Box::new(move |event: AnswerEvent| {
            if cancel.is_cancelled() {
                debug!("Dropping event of cancelled session");
                return;
            }
            if let AnswerEvent::Error {
                kind: Some(kind), ..
            } = &event
            {
                let _ = failure.set(*kind);
            }
            if sender.send(event).is_err() {
                debug!("Answer channel closed, dropping event");
            }
        })
    };

    let prepared = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        prepared = prepare(resolver.as_ref(), store.as_ref(), &request) => prepared,
    };

    let cleanup = match prepared {
        Ok((provider, prompt)) => provider.generate_answer(&prompt, &on_event, cancel).await,
        Err(e) => {
            error!("Failed to start answer session: {:#}", e);
            on_event(AnswerEvent::from_error(&e));
            None
        }
    };

    if failure.get().is_some_and(ErrorKind::is_reauthorizable) {
        if let Some(token_cache) = token_cache {
            token_cache.clear().await;
        }
    }

    cleanup
}

async fn prepare(
    resolver: &dyn ProviderResolver,
    store: &dyn ConfigStore,
    request: &SessionRequest,
) -> Result<(Box<dyn Provider>, String)> {
    let configs = store.provider_configs()?;
    let user_config = store.user_config()?;
    let prompt = prompt::build_prompt(&request.question, &user_config);

    let provider = resolver.create(&configs, request.provider_override).await?;
    Ok((provider, prompt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::memory::MemoryConfigStore;
    use crate::settings::{Language, UserConfig};
    use async_trait::async_trait;
    use llm::{Answer, ApiError, FetchProxy, ProviderConfigs, ProxyRequest, ProxyResponse};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn answer(text: &str) -> AnswerEvent {
        AnswerEvent::Answer(Answer {
            text: text.to_string(),
            ..Default::default()
        })
    }

    #[derive(Clone, Default)]
    struct ProviderLog {
        prompts: Arc<Mutex<Vec<String>>>,
        cleanups: Arc<AtomicUsize>,
    }

    /// Emits a fixed event script with a delay before each event
    struct ScriptedProvider {
        script: Vec<AnswerEvent>,
        delay: Duration,
        honor_cancel: bool,
        log: ProviderLog,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn generate_answer(
            &self,
            prompt: &str,
            on_event: &EventCallback,
            cancel: CancellationToken,
        ) -> Option<Cleanup> {
            self.log.prompts.lock().unwrap().push(prompt.to_string());
            for event in &self.script {
                if self.honor_cancel {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                } else {
                    tokio::time::sleep(self.delay).await;
                }
                on_event(event.clone());
            }

            let cleanups = self.log.cleanups.clone();
            Some(Box::pin(async move {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    /// Hands out one scripted outcome per `create` call
    struct ScriptedResolver {
        outcomes: Mutex<VecDeque<Result<ScriptedProvider, ApiError>>>,
        overrides: Mutex<Vec<Option<ProviderKind>>>,
    }

    impl ScriptedResolver {
        fn new(outcomes: Vec<Result<ScriptedProvider, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                overrides: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderResolver for ScriptedResolver {
        async fn create(
            &self,
            _configs: &ProviderConfigs,
            override_kind: Option<ProviderKind>,
        ) -> Result<Box<dyn Provider>> {
            self.overrides.lock().unwrap().push(override_kind);
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected provider request");
            Ok(Box::new(outcome?))
        }
    }

    struct UnreachableProxy;

    #[async_trait]
    impl FetchProxy for UnreachableProxy {
        async fn fetch(&self, _request: ProxyRequest) -> Result<ProxyResponse> {
            Err(ApiError::Network("offline".to_string()).into())
        }
    }

    fn provider(script: Vec<AnswerEvent>, log: &ProviderLog) -> ScriptedProvider {
        ScriptedProvider {
            script,
            delay: Duration::from_millis(5),
            honor_cancel: true,
            log: log.clone(),
        }
    }

    fn manager(resolver: Arc<ScriptedResolver>, user: UserConfig) -> AnswerSessionManager {
        let store = Arc::new(MemoryConfigStore::new(ProviderConfigs::default(), user));
        AnswerSessionManager::new(resolver, store)
    }

    async fn collect(mut receiver: SessionEvents) -> Vec<AnswerEvent> {
        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = receiver.recv().await {
                events.push(event);
            }
        })
        .await
        .expect("session did not finish");
        events
    }

    #[tokio::test]
    async fn relays_events_in_order() {
        let log = ProviderLog::default();
        let resolver = ScriptedResolver::new(vec![Ok(provider(
            vec![answer("Hel"), answer("Hello"), AnswerEvent::Done],
            &log,
        ))]);
        let mut manager = manager(resolver.clone(), UserConfig::default());

        let events = collect(manager.start_session("greet", Some(ProviderKind::Gemini))).await;

        assert_eq!(events, vec![answer("Hel"), answer("Hello"), AnswerEvent::Done]);
        assert_eq!(*log.prompts.lock().unwrap(), vec!["greet"]);
        assert_eq!(
            *resolver.overrides.lock().unwrap(),
            vec![Some(ProviderKind::Gemini)]
        );
        assert_eq!(manager.last_failure(), None);
    }

    #[tokio::test]
    async fn prompt_carries_language_directive() {
        let log = ProviderLog::default();
        let resolver =
            ScriptedResolver::new(vec![Ok(provider(vec![AnswerEvent::Done], &log))]);
        let user = UserConfig {
            language: Language::Japanese,
            ..Default::default()
        };
        let mut manager = manager(resolver, user);

        collect(manager.start_session("What is Rust?", None)).await;
        assert_eq!(
            *log.prompts.lock().unwrap(),
            vec!["What is Rust?(in japanese)"]
        );
    }

    #[tokio::test]
    async fn factory_errors_become_error_events() {
        let resolver = ScriptedResolver::new(vec![Err(ApiError::Configuration(
            "API key or model not set for OpenAI API".to_string(),
        ))]);
        let mut manager = manager(resolver, UserConfig::default());

        let events = collect(manager.start_session("q", None)).await;
        assert_eq!(
            events,
            vec![AnswerEvent::Error {
                message: "API key or model not set for OpenAI API".to_string(),
                kind: Some(ErrorKind::Configuration),
            }]
        );
        assert_eq!(manager.last_failure(), Some(ErrorKind::Configuration));
        assert!(manager.resume().is_none());
    }

    #[tokio::test]
    async fn cancel_after_first_delta_suppresses_later_events() {
        let log = ProviderLog::default();
        let mut stubborn = provider(
            vec![answer("Hel"), answer("Hello"), AnswerEvent::Done],
            &log,
        );
        stubborn.delay = Duration::from_millis(50);
        stubborn.honor_cancel = false;
        let resolver = ScriptedResolver::new(vec![Ok(stubborn)]);
        let mut manager = manager(resolver, UserConfig::default());

        let mut receiver = manager.start_session("q", None);
        let first = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(answer("Hel")));

        let cleanup = manager.cancel_session().expect("active session");
        tokio::time::timeout(Duration::from_secs(5), cleanup)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(collect(receiver).await, vec![]);
        assert_eq!(log.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_discards_events_already_queued() {
        let log = ProviderLog::default();
        let mut eager = provider(
            vec![answer("a"), answer("ab"), answer("abc"), AnswerEvent::Done],
            &log,
        );
        eager.delay = Duration::ZERO;
        eager.honor_cancel = false;
        let resolver = ScriptedResolver::new(vec![Ok(eager)]);
        let mut manager = manager(resolver, UserConfig::default());

        let mut receiver = manager.start_session("q", None);
        let first = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(answer("a")));

        // Let the provider run to completion so its events sit in the channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cleanup = manager.cancel_session().expect("active session");
        tokio::time::timeout(Duration::from_secs(5), cleanup)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(collect(receiver).await, vec![]);
    }

    #[tokio::test]
    async fn new_session_supersedes_previous_one() {
        let slow_log = ProviderLog::default();
        let mut slow = provider(vec![answer("old"), AnswerEvent::Done], &slow_log);
        slow.delay = Duration::from_millis(200);
        let fast_log = ProviderLog::default();
        let fast = provider(vec![answer("new"), AnswerEvent::Done], &fast_log);

        let resolver = ScriptedResolver::new(vec![Ok(slow), Ok(fast)]);
        let mut manager = manager(resolver, UserConfig::default());

        let old = manager.start_session("first", None);
        // Let the first session reach its provider
        tokio::time::sleep(Duration::from_millis(20)).await;
        let new = manager.start_session("second", None);

        assert_eq!(collect(new).await, vec![answer("new"), AnswerEvent::Done]);
        assert_eq!(collect(old).await, vec![]);
        assert_eq!(*slow_log.prompts.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn resume_retries_after_authorization_failure() {
        let log = ProviderLog::default();
        let resolver = ScriptedResolver::new(vec![
            Err(ApiError::Unauthorized),
            Ok(provider(vec![answer("Hi"), AnswerEvent::Done], &log)),
        ]);
        let proxy: Arc<dyn FetchProxy> = Arc::new(UnreachableProxy);
        let token_cache = Arc::new(AccessTokenCache::new(proxy, "https://chat.example.com"));
        token_cache.set("stale".to_string()).await;

        let mut manager =
            manager(resolver, UserConfig::default()).with_token_cache(token_cache.clone());

        let events = collect(manager.start_session("q", None)).await;
        assert_eq!(
            events,
            vec![AnswerEvent::Error {
                message: "UNAUTHORIZED".to_string(),
                kind: Some(ErrorKind::Unauthorized),
            }]
        );
        assert_eq!(token_cache.get().await, None);

        let retried = manager.resume().expect("session should be resumable");
        assert_eq!(collect(retried).await, vec![answer("Hi"), AnswerEvent::Done]);
        assert_eq!(*log.prompts.lock().unwrap(), vec!["q"]);
    }

    #[tokio::test]
    async fn resume_ignores_transport_failures() {
        let log = ProviderLog::default();
        let failing = provider(
            vec![AnswerEvent::Error {
                message: "500 Internal Server Error".to_string(),
                kind: Some(ErrorKind::Transport),
            }],
            &log,
        );
        let resolver = ScriptedResolver::new(vec![Ok(failing)]);
        let mut manager = manager(resolver, UserConfig::default());

        collect(manager.start_session("q", None)).await;
        assert_eq!(manager.last_failure(), Some(ErrorKind::Transport));
        assert!(manager.resume().is_none());
    }

    #[tokio::test]
    async fn closed_receiver_does_not_break_session() {
        let log = ProviderLog::default();
        let resolver = ScriptedResolver::new(vec![Ok(provider(
            vec![answer("a"), answer("ab"), AnswerEvent::Done],
            &log,
        ))]);
        let mut manager = manager(resolver, UserConfig::default());

        drop(manager.start_session("q", None));
        let cleanup = manager.cancel_session().expect("active session");
        tokio::time::timeout(Duration::from_secs(5), cleanup)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.cancel_session().is_none());
    }
}
