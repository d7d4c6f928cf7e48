use log::{ info, warn };
use std::fmt;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{ oneshot, watch };
use tokio::task::JoinHandle;

use crate::cli::Args;
use crate::code_blocks::{ self, CodeBlock };
use crate::error::ChatError;
use crate::history::{ SessionPersistence, SettingsStore };
use crate::llm::chat::{ ChatTransport, ProgressCallback, ProgressReporter };
use crate::llm::{ payload, reconcile, RequestConfig };
use crate::models::chat::{ Conversation, Turn };
use crate::models::completion::RequestEnvelope;

pub const DEFAULT_USER_ID: &str = "user";

#[derive(Clone)]
pub struct SessionOptions {
    pub credential: String,
    pub user_id: String,
    pub config: RequestConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            credential: String::new(),
            user_id: DEFAULT_USER_ID.to_string(),
            config: RequestConfig::default(),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("credential", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("config", &self.config)
            .finish()
    }
}

impl SessionOptions {
    pub fn from_args(args: &Args) -> Self {
        Self {
            credential: args.api_key.clone(),
            user_id: args.user_id.clone(),
            config: RequestConfig::new(args.model.clone(), args.temperature, args.timeout),
        }
    }
}

struct SessionState {
    conversation: Conversation,
    config: RequestConfig,
    credential: String,
    // Bumped whenever the transcript is replaced; replies built against an
    // older epoch are dropped.
    epoch: u64,
}

struct SessionShared {
    user_id: String,
    transport: Arc<dyn ChatTransport>,
    persistence: SessionPersistence,
    state: Mutex<SessionState>,
    busy: AtomicBool,
    progress: Arc<watch::Sender<f32>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the busy flag on drop, so the flag is released on every exit
/// path of a request task, including abort.
struct BusyGuard {
    shared: Arc<SessionShared>,
}

impl BusyGuard {
    fn acquire(shared: &Arc<SessionShared>) -> Result<Self, ChatError> {
        if
            shared.busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return Err(ChatError::Busy);
        }
        Ok(Self { shared: shared.clone() })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.shared.busy.store(false, Ordering::Release);
    }
}

struct PendingRequest {
    guard: BusyGuard,
    envelope: RequestEnvelope,
    credential: String,
    timeout: Duration,
    epoch: u64,
}

/// One conversation with the completion endpoint.
///
/// At most one request is in flight at a time; a `send` made while one is
/// running is rejected with [`ChatError::Busy`]. The user's turn is appended
/// before the request leaves and stays there even if the request fails.
///
/// Dropping the session aborts any in-flight request.
pub struct ChatSession {
    shared: Arc<SessionShared>,
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn SettingsStore>,
        options: SessionOptions
    ) -> Self {
        let user_id = if options.user_id.trim().is_empty() {
            DEFAULT_USER_ID.to_string()
        } else {
            options.user_id
        };
        let (progress, _) = watch::channel(0.0);

        Self {
            shared: Arc::new(SessionShared {
                user_id,
                transport,
                persistence: SessionPersistence::new(store),
                state: Mutex::new(SessionState {
                    conversation: Conversation::new(),
                    config: options.config,
                    credential: options.credential,
                    epoch: 0,
                }),
                busy: AtomicBool::new(false),
                progress: Arc::new(progress),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    /// True when `turn` was written by the local user rather than the model.
    pub fn is_self_turn(&self, turn: &Turn) -> bool {
        turn.role == self.shared.user_id
    }

    pub fn history(&self) -> Vec<Turn> {
        self.shared.state().conversation.turns().to_vec()
    }

    pub fn config(&self) -> RequestConfig {
        self.shared.state().config.clone()
    }

    pub fn model(&self) -> String {
        self.shared.state().config.model().to_string()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        self.shared.state().config.set_model(model);
    }

    pub fn temperature(&self) -> f32 {
        self.shared.state().config.temperature()
    }

    /// Clamped into `[0, 2]`.
    pub fn set_temperature(&self, temperature: f32) {
        self.shared.state().config.set_temperature(temperature);
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.shared.state().config.timeout_seconds()
    }

    /// Clamped into `[30, 120]`.
    pub fn set_timeout_seconds(&self, seconds: u64) {
        self.shared.state().config.set_timeout_seconds(seconds);
    }

    pub fn set_credential(&self, credential: impl Into<String>) {
        self.shared.state().credential = credential.into();
    }

    pub fn has_credential(&self) -> bool {
        !self.shared.state().credential.trim().is_empty()
    }

    pub fn is_requesting(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Progress of the in-flight request, or 0 when idle.
    pub fn request_progress(&self) -> f32 {
        if self.is_requesting() {
            *self.shared.progress.borrow()
        } else {
            0.0
        }
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<f32> {
        self.shared.progress.subscribe()
    }

    /// Code blocks of the model reply at `index`. `None` for the user's own
    /// turns and for replies without any fenced block.
    pub fn code_blocks(&self, index: usize) -> Option<Vec<CodeBlock>> {
        let state = self.shared.state();
        let turn = state.conversation.get(index)?;
        if self.is_self_turn(turn) {
            return None;
        }
        let blocks = code_blocks::extract(&turn.content);
        if blocks.is_empty() {
            None
        } else {
            Some(blocks)
        }
    }

    /// Sends `text` in the background.
    ///
    /// `on_complete` receives `(true, reply)` on success and
    /// `(false, diagnostic)` otherwise. It is not called when the request is
    /// cancelled. `on_progress` sees each progress increase.
    pub fn send<C, P>(&self, text: &str, on_complete: C, on_progress: P)
        where C: FnOnce(bool, String) + Send + 'static, P: Fn(f32) + Send + Sync + 'static
    {
        let finish = move |result: Result<String, ChatError>| {
            match result {
                Ok(reply) => on_complete(true, reply),
                Err(e) => on_complete(false, e.to_string()),
            }
        };
        let on_progress: ProgressCallback = Box::new(on_progress);
        if let Err((e, finish)) = self.dispatch(text, Some(on_progress), finish) {
            finish(Err(e));
        }
    }

    /// Sends `text` and waits for the reply.
    pub async fn send_async(&self, text: &str) -> Result<String, ChatError> {
        let (tx, rx) = oneshot::channel();
        let finish = move |result: Result<String, ChatError>| {
            let _ = tx.send(result);
        };
        if let Err((e, _)) = self.dispatch(text, None, finish) {
            return Err(e);
        }
        rx.await.unwrap_or_else(|_| Err(ChatError::Cancelled))
    }

    /// Clears the transcript. Config and credential are kept. A reply still
    /// in flight is discarded when it lands.
    pub fn new_chat(&self) {
        let mut state = self.shared.state();
        state.conversation.clear();
        state.epoch = state.epoch.wrapping_add(1);
        info!("Started a new chat");
    }

    /// Loads saved state. Slots that are missing or unreadable leave the
    /// current in-memory value untouched.
    pub async fn restore_history(&self) {
        let (conversation, config) = self.shared.persistence.restore().await;
        let mut state = self.shared.state();
        if let Some(conversation) = conversation {
            info!("Restored {} turns of chat history", conversation.len());
            state.conversation = conversation;
            state.epoch = state.epoch.wrapping_add(1);
        }
        if let Some(config) = config {
            state.config = config;
        }
    }

    pub async fn save_history(&self) -> Result<(), ChatError> {
        let (conversation, config) = {
            let state = self.shared.state();
            (state.conversation.clone(), state.config.clone())
        };
        self.shared.persistence.save(&conversation, &config).await
    }

    /// Aborts the in-flight request, if any, and waits until its connection
    /// and busy flag have been released. The transcript keeps whatever it
    /// held; no reply is appended.
    pub async fn cancel(&self) {
        let handle = self.shared.in_flight().take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                info!("Cancelling in-flight chat request");
            }
            handle.abort();
            let _ = handle.await;
        }
    }

    // Hands `finish` back on failure so the caller decides how to report it.
    fn dispatch<F>(
        &self,
        text: &str,
        on_progress: Option<ProgressCallback>,
        finish: F
    ) -> Result<(), (ChatError, F)>
        where F: FnOnce(Result<String, ChatError>) + Send + 'static
    {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                return Err((ChatError::Transport(format!("No async runtime available: {}", e)), finish));
            }
        };
        // Held until the handle is stored, so a concurrent `cancel` either
        // sees this request or runs before it starts.
        let mut in_flight = self.shared.in_flight();
        let pending = match self.begin(text) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Rejected chat request: {}", e);
                return Err((e, finish));
            }
        };

        let shared = self.shared.clone();
        let progress = ProgressReporter::new(self.shared.progress.clone(), on_progress);
        let task = runtime.spawn(async move {
            let result = Self::run(shared, pending, progress).await;
            finish(result);
        });
        *in_flight = Some(task);
        Ok(())
    }

    fn begin(&self, text: &str) -> Result<PendingRequest, ChatError> {
        let guard = BusyGuard::acquire(&self.shared)?;
        let mut state = self.shared.state();
        state.conversation.push(Turn::new(self.shared.user_id.clone(), text));
        let envelope = payload::build(&state.conversation, &state.config);
        info!(
            "Sending chat request: model={}, turns={}",
            envelope.model,
            envelope.messages.len()
        );
        self.shared.progress.send_replace(0.0);

        Ok(PendingRequest {
            guard,
            envelope,
            credential: state.credential.clone(),
            timeout: state.config.timeout(),
            epoch: state.epoch,
        })
    }

    async fn run(
        shared: Arc<SessionShared>,
        pending: PendingRequest,
        progress: ProgressReporter
    ) -> Result<String, ChatError> {
        let PendingRequest { guard, envelope, credential, timeout, epoch } = pending;

        let raw = shared.transport.execute(&envelope, &credential, timeout, &progress).await?;
        let reply = reconcile::apply(&raw)?;

        let mut state = shared.state();
        if state.epoch != epoch {
            warn!("Dropping reply for a chat that was reset while the request was in flight");
            return Err(ChatError::Discarded);
        }
        let content = reply.content.clone();
        state.conversation.push(reply);
        drop(state);
        drop(guard);
        Ok(content)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.in_flight().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemorySettingsStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    enum Step {
        Reply(String),
        Fail(&'static str),
        Gated(Arc<Notify>, String),
        Hang(Arc<AtomicBool>),
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct ActiveCount<'a>(&'a AtomicUsize);

    impl Drop for ActiveCount<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockTransport {
        steps: Mutex<VecDeque<Step>>,
        seen: Mutex<Vec<(RequestEnvelope, String)>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockTransport {
        fn scripted(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                ..Default::default()
            })
        }

        fn seen(&self) -> Vec<(RequestEnvelope, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn execute(
            &self,
            envelope: &RequestEnvelope,
            credential: &str,
            _timeout: Duration,
            progress: &ProgressReporter
        ) -> Result<String, ChatError> {
            let step = self.steps.lock().unwrap().pop_front().expect("unexpected request");
            self.seen.lock().unwrap().push((envelope.clone(), credential.to_string()));
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _active = ActiveCount(&self.active);

            progress.upload(1.0);
            match step {
                Step::Reply(body) => {
                    progress.download(1.0);
                    Ok(body)
                }
                Step::Fail(msg) => Err(ChatError::Transport(msg.to_string())),
                Step::Gated(gate, body) => {
                    gate.notified().await;
                    progress.download(1.0);
                    Ok(body)
                }
                Step::Hang(dropped) => {
                    let _flag = DropFlag(dropped);
                    futures::future::pending::<()>().await;
                    Ok(String::new())
                }
            }
        }

        fn endpoint(&self) -> &str {
            "mock://completions"
        }
    }

    fn reply(content: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-3.5-turbo",
            "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 },
            "choices": [
                { "message": { "role": "assistant", "content": content }, "finish_reason": "stop", "index": 0 }
            ]
        }).to_string()
    }

    fn session_with(
        transport: &Arc<MockTransport>,
        store: &Arc<MemorySettingsStore>
    ) -> ChatSession {
        ChatSession::new(transport.clone(), store.clone(), SessionOptions {
            credential: "sk-test".to_string(),
            ..Default::default()
        })
    }

    fn session(steps: Vec<Step>) -> (ChatSession, Arc<MockTransport>) {
        let transport = MockTransport::scripted(steps);
        let store = Arc::new(MemorySettingsStore::new());
        (session_with(&transport, &store), transport)
    }

    fn completion() -> (impl FnOnce(bool, String) + Send + 'static, oneshot::Receiver<(bool, String)>) {
        let (tx, rx) = oneshot::channel();
        (
            move |ok, text| {
                let _ = tx.send((ok, text));
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_send_appends_user_turn_then_reply() {
        let (session, transport) = session(vec![Step::Reply(reply("  pong \n"))]);

        let answer = session.send_async("ping").await.unwrap();
        assert_eq!(answer, "pong");
        assert_eq!(
            session.history(),
            vec![Turn::new("user", "ping"), Turn::new("assistant", "pong")]
        );
        assert!(!session.is_requesting());
        assert_eq!(session.request_progress(), 0.0);

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.messages, vec![Turn::new("user", "ping")]);
        assert_eq!(seen[0].1, "sk-test");
    }

    #[tokio::test]
    async fn test_send_callback_reports_success_and_progress() {
        let (session, _) = session(vec![Step::Reply(reply("hello back"))]);
        let samples = Arc::new(Mutex::new(Vec::new()));
        let recorder = samples.clone();
        let (on_complete, done) = completion();

        session.send("hello", on_complete, move |p| recorder.lock().unwrap().push(p));
        assert_eq!(session.history(), vec![Turn::new("user", "hello")]);

        assert_eq!(done.await.unwrap(), (true, "hello back".to_string()));
        let samples = samples.lock().unwrap().clone();
        assert!(!samples.is_empty());
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(samples.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_second_send_while_requesting_is_rejected() {
        let gate = Arc::new(Notify::new());
        let (session, transport) = session(vec![Step::Gated(gate.clone(), reply("first"))]);

        let (on_first, first) = completion();
        session.send("a", on_first, |_| {});
        assert!(session.is_requesting());

        let (on_second, second) = completion();
        session.send("b", on_second, |_| {});
        let (ok, message) = second.await.unwrap();
        assert!(!ok);
        assert_eq!(message, ChatError::Busy.to_string());
        assert!(matches!(session.send_async("c").await, Err(ChatError::Busy)));

        gate.notify_one();
        assert_eq!(first.await.unwrap(), (true, "first".to_string()));
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
        assert_eq!(transport.seen().len(), 1);
        assert_eq!(
            session.history(),
            vec![Turn::new("user", "a"), Turn::new("assistant", "first")]
        );
    }

    #[tokio::test]
    async fn test_busy_flag_released_before_completion_callback() {
        let (session, _) = session(vec![Step::Reply(reply("one")), Step::Reply(reply("two"))]);
        assert_eq!(session.send_async("1").await.unwrap(), "one");
        assert_eq!(session.send_async("2").await.unwrap(), "two");
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_user_turn() {
        let (session, _) = session(vec![Step::Fail("connection reset")]);
        let (on_complete, done) = completion();

        session.send("hello", on_complete, |_| {});
        let (ok, message) = done.await.unwrap();
        assert!(!ok);
        assert!(message.contains("connection reset"));
        assert_eq!(session.history(), vec![Turn::new("user", "hello")]);
        assert!(!session.is_requesting());
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_user_turn() {
        let (session, _) = session(vec![Step::Reply(r#"{"choices":[]}"#.to_string())]);
        let err = session.send_async("hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Parse(_)));
        assert_eq!(session.history(), vec![Turn::new("user", "hello")]);
    }

    #[tokio::test]
    async fn test_last_choice_is_appended() {
        let body = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "X" } },
                { "message": { "role": "assistant", "content": " Y " } }
            ]
        }).to_string();
        let (session, _) = session(vec![Step::Reply(body)]);

        session.send_async("pick").await.unwrap();
        assert_eq!(session.history().last(), Some(&Turn::new("assistant", "Y")));
    }

    #[tokio::test]
    async fn test_new_chat_keeps_config_and_credential() {
        let (session, transport) = session(vec![Step::Reply(reply("a")), Step::Reply(reply("b"))]);
        session.set_model("gpt-4o");
        session.set_temperature(1.2);
        session.set_timeout_seconds(90);
        session.set_credential("sk-other");
        session.send_async("first").await.unwrap();

        let before = session.config();
        session.new_chat();
        assert!(session.history().is_empty());
        assert_eq!(session.config(), before);
        assert!(session.has_credential());

        session.send_async("second").await.unwrap();
        let seen = transport.seen();
        assert_eq!(seen[1].0.messages, vec![Turn::new("user", "second")]);
        assert_eq!(seen[1].0.model, "gpt-4o");
        assert_eq!(seen[1].0.temperature, 1.2);
        assert_eq!(seen[1].1, "sk-other");
    }

    #[tokio::test]
    async fn test_reply_after_new_chat_is_discarded() {
        let gate = Arc::new(Notify::new());
        let (session, _) = session(vec![Step::Gated(gate.clone(), reply("late"))]);
        let (on_complete, done) = completion();

        session.send("question", on_complete, |_| {});
        session.new_chat();
        gate.notify_one();

        let (ok, message) = done.await.unwrap();
        assert!(!ok);
        assert_eq!(message, ChatError::Discarded.to_string());
        assert!(session.history().is_empty());
        assert!(!session.is_requesting());
    }

    #[tokio::test]
    async fn test_temperature_and_timeout_are_clamped() {
        let (session, _) = session(vec![]);
        session.set_temperature(-1.0);
        assert_eq!(session.temperature(), 0.0);
        session.set_temperature(5.0);
        assert_eq!(session.temperature(), 2.0);
        session.set_timeout_seconds(1);
        assert_eq!(session.timeout_seconds(), 30);
    }

    #[tokio::test]
    async fn test_save_and_restore_across_sessions() {
        let transport = MockTransport::scripted(vec![Step::Reply(reply("saved reply"))]);
        let store = Arc::new(MemorySettingsStore::new());

        let first = session_with(&transport, &store);
        first.set_temperature(0.75);
        first.send_async("remember me").await.unwrap();
        first.save_history().await.unwrap();
        let saved_history = first.history();
        let saved_config = first.config();
        drop(first);

        let second = session_with(&transport, &store);
        assert!(second.history().is_empty());
        second.restore_history().await;
        assert_eq!(second.history(), saved_history);
        assert_eq!(second.config(), saved_config);
    }

    #[tokio::test]
    async fn test_restore_with_corrupt_slots_keeps_current_state() {
        let transport = MockTransport::scripted(vec![Step::Reply(reply("kept"))]);
        let store = Arc::new(MemorySettingsStore::new());
        store.set(crate::history::HISTORY_SLOT, "{{{").await.unwrap();
        store.set(crate::history::REQUEST_CONFIG_SLOT, "not json").await.unwrap();

        let session = session_with(&transport, &store);
        session.set_model("gpt-4o");
        session.send_async("keep").await.unwrap();

        session.restore_history().await;
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.model(), "gpt-4o");
    }

    #[tokio::test]
    async fn test_credential_is_not_persisted() {
        let transport = MockTransport::scripted(vec![]);
        let store = Arc::new(MemorySettingsStore::new());
        let session = session_with(&transport, &store);
        session.set_credential("sk-secret-value");
        session.save_history().await.unwrap();

        for slot in [crate::history::HISTORY_SLOT, crate::history::REQUEST_CONFIG_SLOT] {
            let raw = store.get(slot).await.unwrap().unwrap();
            assert!(!raw.contains("sk-secret-value"));
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_request_and_keeps_transcript() {
        let dropped = Arc::new(AtomicBool::new(false));
        let (session, transport) = session(vec![Step::Hang(dropped.clone())]);

        let (result, _) = tokio::join!(session.send_async("wait"), async {
            while transport.seen().is_empty() {
                tokio::task::yield_now().await;
            }
            session.cancel().await;
        });

        assert!(matches!(result, Err(ChatError::Cancelled)));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!session.is_requesting());
        assert_eq!(session.history(), vec![Turn::new("user", "wait")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_on_another_worker_sees_request_once_send_returns() {
        let (session, _) = session(vec![Step::Hang(Arc::new(AtomicBool::new(false)))]);
        let session = Arc::new(session);
        session.send("wait", |_, _| panic!("callback must not run"), |_| {});

        let other = session.clone();
        tokio::spawn(async move { other.cancel().await }).await.unwrap();

        assert!(!session.is_requesting());
        assert_eq!(session.history(), vec![Turn::new("user", "wait")]);
    }

    #[tokio::test]
    async fn test_dropping_session_aborts_request() {
        let dropped = Arc::new(AtomicBool::new(false));
        let (session, transport) = session(vec![Step::Hang(dropped.clone())]);
        session.send("bye", |_, _| panic!("callback must not run"), |_| {});
        while transport.seen().is_empty() {
            tokio::task::yield_now().await;
        }
        drop(session);

        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_send_without_runtime_reports_failure() {
        let (session, transport) = session(vec![]);
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();

        session.send("hello", move |ok, text| *slot.lock().unwrap() = Some((ok, text)), |_| {});
        let (ok, _) = result.lock().unwrap().clone().unwrap();
        assert!(!ok);
        assert!(session.history().is_empty());
        assert!(!session.is_requesting());
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_self_turns_and_code_blocks() {
        let (session, _) = session(vec![Step::Reply(reply("Try:\n```rust\nfn main() {}\n```"))]);
        session.send_async("```rust\nlet mine = 1;\n```").await.unwrap();

        let history = session.history();
        assert!(session.is_self_turn(&history[0]));
        assert!(!session.is_self_turn(&history[1]));

        assert!(session.code_blocks(0).is_none());
        let blocks = session.code_blocks(1).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file_extension, "rs");
        assert!(session.code_blocks(5).is_none());
    }

    #[test]
    fn test_blank_user_id_falls_back_to_default() {
        let transport = MockTransport::scripted(vec![]);
        let session = ChatSession::new(transport, Arc::new(MemorySettingsStore::new()), SessionOptions {
            user_id: "  ".to_string(),
            ..Default::default()
        });
        assert_eq!(session.user_id(), DEFAULT_USER_ID);
        assert!(format!("{:?}", SessionOptions::default()).contains("[REDACTED]"));
    }
}
