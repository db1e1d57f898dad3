//! Session controller: owns the active chat session and drives replies
//! into the transcript.
//!
//! The controller is a cheap, cloneable handle. All state lives behind one
//! mutex that is never held across an await point, so a reply can stream on
//! one task while another task starts a new session. Each reply is tagged
//! with the session generation it belongs to; once a new session starts, any
//! fragment still arriving for the old one is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::curriculum::{self, Topic};
use crate::error::Error;
use crate::message::ChatMessage;
use crate::provider::Provider;
use crate::session::{ChatSession, FragmentStream, SessionConfig, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use crate::transcript::{
    Message, MessageId, MessageIdGen, PatchOutcome, TranscriptEvent, TranscriptStore,
};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    /// Longest wait for the next fragment before the reply counts as failed.
    /// `None` waits forever.
    pub stream_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: None,
            stream_timeout: Some(DEFAULT_STREAM_TIMEOUT),
        }
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("API key is not configured")]
    CredentialMissing,

    #[error("Failed to create chat session: {0}")]
    SessionCreationFailed(#[source] Error),

    #[error("No active chat session")]
    NoSession,

    #[error("A reply is still streaming")]
    Busy,

    #[error("Message is empty")]
    EmptyInput,
}

/// Where a streaming reply currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingFirstFragment,
    Streaming,
    Settled,
    Failed,
}

/// How a reply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply finished; `message_id` is the settled model message.
    Completed { message_id: MessageId },
    /// The reply failed; `message_id` is the appended error message.
    Failed { message_id: MessageId, reason: String },
    /// A new session started before the reply finished.
    Superseded,
}

type Connector = dyn Fn(&str) -> Result<Arc<dyn Provider>, Error> + Send + Sync;

enum Backend {
    Missing,
    Credential {
        credential: String,
        connect: Arc<Connector>,
    },
    Fixed(Arc<dyn Provider>),
}

struct Shared {
    store: TranscriptStore,
    session: Option<Arc<ChatSession>>,
    generation: u64,
    loading: Option<u64>,
    next_ticket: u64,
    phase: Phase,
    topic: Option<&'static Topic>,
}

impl Shared {
    fn take_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.loading = Some(self.next_ticket);
        self.next_ticket
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamTarget {
    generation: u64,
    message_id: MessageId,
}

/// Holds the loading flag for one request. Dropping it releases the flag
/// (unless a newer request owns it) and settles the target message if the
/// request was abandoned mid-stream.
struct LoadingGuard {
    shared: Arc<Mutex<Shared>>,
    ticket: u64,
    target: StreamTarget,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        if state.loading == Some(self.ticket) {
            state.loading = None;
        }
        let abandoned = state.generation == self.target.generation
            && state
                .store
                .get(self.target.message_id)
                .is_some_and(|m| m.is_streaming);
        if abandoned {
            debug!(message_id = %self.target.message_id, "Reply abandoned mid-stream");
            settle_placeholder(&mut state.store, self.target.message_id);
            state.phase = Phase::Failed;
        }
    }
}

/// Freeze a placeholder that will receive no more fragments. One that never
/// got any text is dropped instead of being left as an empty reply.
fn settle_placeholder(store: &mut TranscriptStore, id: MessageId) {
    if !store.remove_empty_placeholder(id) {
        store.mark_streaming_done(id);
    }
}

/// A request that has been admitted and is ready to stream.
struct PendingReply {
    target: StreamTarget,
    session: Arc<ChatSession>,
    prompt: String,
    failure_text: &'static str,
    guard: LoadingGuard,
}

#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Mutex<Shared>>,
    ids: Arc<MessageIdGen>,
    backend: Arc<Backend>,
    config: Arc<ControllerConfig>,
}

impl SessionController {
    /// Create a controller that connects with `credential`. A missing or
    /// blank credential leaves the controller permanently unable to create
    /// sessions; `connect` is then never called.
    pub fn new<F>(credential: Option<String>, connect: F, config: ControllerConfig) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn Provider>, Error> + Send + Sync + 'static,
    {
        let backend = match credential.filter(|c| !c.trim().is_empty()) {
            Some(credential) => Backend::Credential {
                credential,
                connect: Arc::new(connect),
            },
            None => {
                warn!("No API key configured; chat sessions are disabled");
                Backend::Missing
            }
        };
        Self::with_backend(backend, config)
    }

    /// Create a controller around an already connected provider.
    pub fn with_provider(provider: Arc<dyn Provider>, config: ControllerConfig) -> Self {
        Self::with_backend(Backend::Fixed(provider), config)
    }

    fn with_backend(backend: Backend, config: ControllerConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                store: TranscriptStore::new(),
                session: None,
                generation: 0,
                loading: None,
                next_ticket: 0,
                phase: Phase::Idle,
                topic: None,
            })),
            ids: Arc::new(MessageIdGen::new()),
            backend: Arc::new(backend),
            config: Arc::new(config),
        }
    }

    pub fn credential_missing(&self) -> bool {
        matches!(*self.backend, Backend::Missing)
    }

    pub fn has_session(&self) -> bool {
        lock(&self.shared).session.is_some()
    }

    /// True from request issuance until the reply settles or fails.
    pub fn is_loading(&self) -> bool {
        lock(&self.shared).loading.is_some()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.shared).phase
    }

    pub fn active_topic(&self) -> Option<&'static Topic> {
        lock(&self.shared).topic
    }

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        lock(&self.shared).store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        lock(&self.shared).store.subscribe()
    }

    /// Completed exchanges of the current session.
    pub fn history(&self) -> Vec<ChatMessage> {
        let session = lock(&self.shared).session.clone();
        session.map(|s| s.history()).unwrap_or_default()
    }

    /// Replace the current session. Without a topic the new session opens
    /// with a fixed greeting; with one, the tutor's reply to the topic's seed
    /// prompt streams in.
    pub async fn start_session(
        &self,
        topic: Option<&'static Topic>,
    ) -> Result<SendOutcome, ControllerError> {
        if self.credential_missing() {
            return Err(ControllerError::CredentialMissing);
        }

        let generation = self.discard_session(topic);

        let session = match self.create_session(topic) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!(error = %e, "Failed to create chat session");
                return Err(ControllerError::SessionCreationFailed(e));
            }
        };

        match topic {
            None => Ok(self.install_greeting(generation, session)),
            Some(topic) => match self.install_topic(generation, session, topic) {
                Some(pending) => Ok(self.run_reply(pending).await),
                None => Ok(SendOutcome::Superseded),
            },
        }
    }

    /// Send user input on the current session and stream the reply.
    pub async fn send(&self, user_text: &str) -> Result<SendOutcome, ControllerError> {
        if self.credential_missing() {
            return Err(ControllerError::CredentialMissing);
        }
        let pending = self.admit(user_text)?;
        Ok(self.run_reply(pending).await)
    }

    fn discard_session(&self, topic: Option<&'static Topic>) -> u64 {
        let mut state = lock(&self.shared);
        state.generation += 1;
        state.session = None;
        state.loading = None;
        state.phase = Phase::Idle;
        state.topic = None;
        state.store.reset();
        debug!(
            generation = state.generation,
            topic = topic.map(|t| t.id),
            "Starting new session"
        );
        state.generation
    }

    fn create_session(&self, topic: Option<&'static Topic>) -> Result<ChatSession, Error> {
        let provider = match &*self.backend {
            Backend::Missing => return Err(Error::auth("API key is not configured")),
            Backend::Credential {
                credential,
                connect,
            } => connect(credential)?,
            Backend::Fixed(provider) => Arc::clone(provider),
        };

        let config = SessionConfig::new(curriculum::system_instruction(topic))
            .with_model(self.config.model.clone())
            .with_temperature(self.config.temperature)
            .with_max_output_tokens(self.config.max_output_tokens);
        ChatSession::create(provider, config)
    }

    fn install_greeting(&self, generation: u64, session: Arc<ChatSession>) -> SendOutcome {
        let mut state = lock(&self.shared);
        if state.generation != generation {
            return SendOutcome::Superseded;
        }
        state.session = Some(session);
        state.topic = None;
        let message_id = self.ids.next_id();
        state
            .store
            .append(Message::model(message_id, curriculum::GREETING));
        state.phase = Phase::Settled;
        SendOutcome::Completed { message_id }
    }

    fn install_topic(
        &self,
        generation: u64,
        session: Arc<ChatSession>,
        topic: &'static Topic,
    ) -> Option<PendingReply> {
        let mut state = lock(&self.shared);
        if state.generation != generation {
            return None;
        }
        state.session = Some(Arc::clone(&session));
        state.topic = Some(topic);

        let ticket = state.take_ticket();
        let message_id = self.ids.next_id();
        state.store.append(Message::placeholder(message_id));
        state.phase = Phase::AwaitingFirstFragment;

        let target = StreamTarget {
            generation,
            message_id,
        };
        Some(PendingReply {
            target,
            session,
            prompt: topic.seed_prompt(),
            failure_text: curriculum::TOPIC_ERROR,
            guard: LoadingGuard {
                shared: Arc::clone(&self.shared),
                ticket,
                target,
            },
        })
    }

    fn admit(&self, user_text: &str) -> Result<PendingReply, ControllerError> {
        let mut state = lock(&self.shared);
        let Some(session) = state.session.clone() else {
            return Err(ControllerError::NoSession);
        };
        if state.loading.is_some() {
            return Err(ControllerError::Busy);
        }
        if user_text.trim().is_empty() {
            return Err(ControllerError::EmptyInput);
        }

        let ticket = state.take_ticket();
        state
            .store
            .append(Message::user(self.ids.next_id(), user_text));
        let message_id = self.ids.next_id();
        state.store.append(Message::placeholder(message_id));
        state.phase = Phase::AwaitingFirstFragment;

        let target = StreamTarget {
            generation: state.generation,
            message_id,
        };
        Ok(PendingReply {
            target,
            session,
            prompt: user_text.to_string(),
            failure_text: curriculum::SEND_ERROR,
            guard: LoadingGuard {
                shared: Arc::clone(&self.shared),
                ticket,
                target,
            },
        })
    }

    async fn run_reply(&self, pending: PendingReply) -> SendOutcome {
        let PendingReply {
            target,
            session,
            prompt,
            failure_text,
            guard,
        } = pending;

        let outcome = match self.consume(target, &session, &prompt).await {
            Ok(Some(reply)) => self.finish(target, &session, &prompt, &reply),
            Ok(None) => SendOutcome::Superseded,
            Err(e) => self.fail(target, &e, failure_text),
        };
        drop(guard);
        outcome
    }

    /// Pull fragments until the stream ends. `Ok(None)` means the session was
    /// replaced while streaming.
    async fn consume(
        &self,
        target: StreamTarget,
        session: &ChatSession,
        prompt: &str,
    ) -> Result<Option<String>, Error> {
        let mut stream = session.send_message_stream(prompt).await?;
        let mut reply = String::new();

        while let Some(fragment) = self.next_fragment(&mut stream).await {
            let fragment = fragment?;
            reply.push_str(&fragment);
            trace!(
                message_id = %target.message_id,
                fragment_len = fragment.len(),
                total_len = reply.len(),
                "Reply fragment"
            );
            if !self.apply_fragment(target, &reply) {
                return Ok(None);
            }
        }
        Ok(Some(reply))
    }

    async fn next_fragment(&self, stream: &mut FragmentStream) -> Option<Result<String, Error>> {
        match self.config.stream_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(item) => item,
                Err(_) => Some(Err(Error::timeout(format!(
                    "no reply fragment within {limit:?}"
                )))),
            },
            None => stream.next().await,
        }
    }

    fn apply_fragment(&self, target: StreamTarget, reply: &str) -> bool {
        let mut state = lock(&self.shared);
        if state.generation != target.generation {
            debug!(message_id = %target.message_id, "Dropping fragment for replaced session");
            return false;
        }
        state.phase = Phase::Streaming;
        let outcome = state.store.patch_text(target.message_id, reply);
        if outcome != PatchOutcome::Applied {
            warn!(message_id = %target.message_id, ?outcome, "Fragment not applied");
        }
        true
    }

    fn finish(
        &self,
        target: StreamTarget,
        session: &ChatSession,
        prompt: &str,
        reply: &str,
    ) -> SendOutcome {
        let mut state = lock(&self.shared);
        if state.generation != target.generation {
            return SendOutcome::Superseded;
        }
        state.store.mark_streaming_done(target.message_id);
        state.phase = Phase::Settled;
        session.commit_turn(prompt, reply);
        debug!(message_id = %target.message_id, reply_len = reply.len(), "Reply complete");
        SendOutcome::Completed {
            message_id: target.message_id,
        }
    }

    fn fail(&self, target: StreamTarget, error: &Error, failure_text: &str) -> SendOutcome {
        let mut state = lock(&self.shared);
        if state.generation != target.generation {
            debug!(error = %error, "Ignoring failure of replaced session");
            return SendOutcome::Superseded;
        }
        warn!(error = %error, message_id = %target.message_id, "Reply stream failed");

        settle_placeholder(&mut state.store, target.message_id);
        let message_id = self.ids.next_id();
        state.store.append(Message::model(message_id, failure_text));
        state.phase = Phase::Failed;
        SendOutcome::Failed {
            message_id,
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::curriculum::{find_topic, GREETING, SEND_ERROR, TOPIC_ERROR};
    use crate::message::{Role, StreamChunk};
    use crate::testing::ScriptedProvider;

    fn controller() -> (SessionController, Arc<ScriptedProvider>) {
        controller_with(ControllerConfig::default())
    }

    fn controller_with(config: ControllerConfig) -> (SessionController, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new());
        let controller =
            SessionController::with_provider(Arc::clone(&provider) as Arc<dyn Provider>, config);
        (controller, provider)
    }

    /// Wait until the placeholder of an admitted send shows up.
    async fn await_placeholder(events: &mut broadcast::Receiver<TranscriptEvent>) -> MessageId {
        let mut appended = Vec::new();
        while appended.len() < 2 {
            if let TranscriptEvent::Appended(id) = events.recv().await.unwrap() {
                appended.push(id);
            }
        }
        appended[1]
    }

    #[tokio::test]
    async fn test_start_without_topic_greets() {
        let (controller, provider) = controller();
        let outcome = controller.start_session(None).await.unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].role, Role::Model);
        assert_eq!(snapshot[0].text, GREETING);
        assert!(!snapshot[0].is_streaming);
        assert_eq!(
            outcome,
            SendOutcome::Completed {
                message_id: snapshot[0].id
            }
        );
        assert_eq!(controller.phase(), Phase::Settled);
        assert!(!controller.is_loading());
        assert!(controller.has_session());
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_send_streams_into_placeholder() {
        let (controller, provider) = controller();
        controller.start_session(None).await.unwrap();

        let tx = provider.queue_live();
        let mut events = controller.subscribe();
        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("큐가 뭐야?").await }
        });

        let placeholder = await_placeholder(&mut events).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[1].role, Role::User);
        assert_eq!(snapshot[1].text, "큐가 뭐야?");
        assert!(!snapshot[1].is_streaming);
        assert_eq!(snapshot[2].id, placeholder);
        assert_eq!(snapshot[2].role, Role::Model);
        assert_eq!(snapshot[2].text, "");
        assert!(snapshot[2].is_streaming);
        assert!(controller.is_loading());
        assert_eq!(controller.phase(), Phase::AwaitingFirstFragment);

        tx.fragment("큐는 ");
        assert_eq!(events.recv().await.unwrap(), TranscriptEvent::Patched(placeholder));
        assert_eq!(controller.phase(), Phase::Streaming);
        assert_eq!(controller.snapshot()[2].text, "큐는 ");

        tx.fragment("FIFO 구조입니다.");
        assert_eq!(events.recv().await.unwrap(), TranscriptEvent::Patched(placeholder));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot[2].text, "큐는 FIFO 구조입니다.");
        assert!(snapshot[2].is_streaming);

        drop(tx);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Completed {
                message_id: placeholder
            }
        );
        assert_eq!(events.recv().await.unwrap(), TranscriptEvent::StreamingDone(placeholder));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot[2].text, "큐는 FIFO 구조입니다.");
        assert!(!snapshot[2].is_streaming);
        assert!(!controller.is_loading());
        assert_eq!(controller.phase(), Phase::Settled);
        assert_eq!(
            controller.history(),
            vec![
                ChatMessage::user("큐가 뭐야?"),
                ChatMessage::model("큐는 FIFO 구조입니다.")
            ]
        );
    }

    #[tokio::test]
    async fn test_send_preconditions() {
        let (controller, provider) = controller();
        assert!(matches!(
            controller.send("hello").await,
            Err(ControllerError::NoSession)
        ));

        controller.start_session(None).await.unwrap();
        assert!(matches!(
            controller.send("   \n").await,
            Err(ControllerError::EmptyInput)
        ));
        assert_eq!(controller.snapshot().len(), 1);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_second_send_is_rejected_while_loading() {
        let (controller, provider) = controller();
        controller.start_session(None).await.unwrap();

        let tx = provider.queue_live();
        let mut events = controller.subscribe();
        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("first").await }
        });
        await_placeholder(&mut events).await;

        assert!(matches!(
            controller.send("second").await,
            Err(ControllerError::Busy)
        ));
        assert_eq!(controller.snapshot().len(), 3);

        tx.fragment("done");
        drop(tx);
        assert!(matches!(
            task.await.unwrap(),
            Ok(SendOutcome::Completed { .. })
        ));
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn test_stream_failure_appends_error_and_recovers() {
        let (controller, provider) = controller();
        controller.start_session(None).await.unwrap();

        provider.queue_chunks(vec![
            Ok(StreamChunk::Delta {
                content: "부분 응답".to_string(),
            }),
            Err(Error::network("connection reset")),
        ]);
        let outcome = controller.send("힙이 뭐야?").await.unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[2].text, "부분 응답");
        assert!(!snapshot[2].is_streaming);
        assert_eq!(snapshot[3].role, Role::Model);
        assert_eq!(snapshot[3].text, SEND_ERROR);
        assert!(!snapshot[3].is_streaming);
        match outcome {
            SendOutcome::Failed { message_id, reason } => {
                assert_eq!(message_id, snapshot[3].id);
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!controller.is_loading());
        assert_eq!(controller.phase(), Phase::Failed);
        assert!(controller.history().is_empty());

        // The session stays usable and the failed turn is not in history.
        provider.queue_fragments(["다시 ", "설명할게요."]);
        let outcome = controller.send("다시").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { .. }));
        assert_eq!(provider.last_request().unwrap().messages.len(), 1);
        assert_eq!(controller.snapshot().last().unwrap().text, "다시 설명할게요.");
    }

    #[tokio::test]
    async fn test_rejected_request_settles_placeholder() {
        let (controller, provider) = controller();
        controller.start_session(None).await.unwrap();
        provider.queue_rejection(Error::auth("API key not valid"));

        let outcome = controller.send("hi").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Failed { .. }));

        // No empty reply is left between the question and the error.
        let snapshot = controller.snapshot();
        let turns: Vec<(Role, &str)> = snapshot.iter().map(|m| (m.role, m.text.as_str())).collect();
        assert_eq!(
            turns,
            vec![
                (Role::Model, GREETING),
                (Role::User, "hi"),
                (Role::Model, SEND_ERROR),
            ]
        );
        assert!(snapshot.iter().all(|m| !m.is_streaming));
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn test_stream_timeout_fails_reply() {
        let (controller, provider) = controller_with(ControllerConfig {
            stream_timeout: Some(Duration::from_millis(20)),
            ..ControllerConfig::default()
        });
        controller.start_session(None).await.unwrap();
        provider.queue_pending();

        match controller.send("hello").await.unwrap() {
            SendOutcome::Failed { reason, .. } => assert!(reason.contains("Timeout")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn test_topic_session_streams_seed_reply() {
        let (controller, provider) = controller();
        let topic = find_topic("dp").unwrap();
        provider.queue_fragments(["DP는 ", "작은 문제로 나누는 방법입니다."]);

        let outcome = controller.start_session(Some(topic)).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { .. }));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].role, Role::Model);
        assert_eq!(snapshot[0].text, "DP는 작은 문제로 나누는 방법입니다.");
        assert!(!snapshot[0].is_streaming);
        assert_eq!(controller.active_topic(), Some(topic));

        let request = provider.last_request().unwrap();
        assert_eq!(request.messages, vec![ChatMessage::user(topic.seed_prompt())]);
        assert!(request
            .system_instruction
            .unwrap()
            .contains("다이나믹 프로그래밍"));

        provider.queue_fragments(["네."]);
        controller.send("예제 보여줘").await.unwrap();
        assert_eq!(provider.last_request().unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn test_topic_failure_shows_error() {
        let (controller, provider) = controller();
        provider.queue_rejection(Error::network("offline"));

        let outcome = controller
            .start_session(find_topic("tree"))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Failed { .. }));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, TOPIC_ERROR);
        assert!(snapshot.iter().all(|m| !m.is_streaming));
        assert!(!controller.is_loading());
        assert!(controller.has_session());
    }

    #[tokio::test]
    async fn test_fragments_after_session_switch_are_dropped() {
        let (controller, provider) = controller();
        controller.start_session(None).await.unwrap();

        let tx = provider.queue_live();
        let mut events = controller.subscribe();
        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("큐가 뭐야?").await }
        });
        let m1 = await_placeholder(&mut events).await;
        assert!(controller.snapshot().iter().any(|m| m.id == m1 && m.is_streaming));

        let topic_b = find_topic("stack_queue").unwrap();
        provider.queue_fragments(["스택은 ", "LIFO입니다."]);
        controller.start_session(Some(topic_b)).await.unwrap();

        tx.fragment("늦게 도착한 조각");
        drop(tx);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Superseded);

        let snapshot = controller.snapshot();
        assert!(snapshot.iter().all(|m| m.id != m1));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "스택은 LIFO입니다.");
        assert!(!snapshot.iter().any(|m| m.text.contains("늦게")));
        assert!(!controller.is_loading());
        assert_eq!(controller.phase(), Phase::Settled);
        assert_eq!(controller.active_topic(), Some(topic_b));
    }

    #[tokio::test]
    async fn test_new_session_clears_transcript() {
        let (controller, provider) = controller();
        controller.start_session(None).await.unwrap();
        provider.queue_fragments(["a"]);
        controller.send("q").await.unwrap();
        assert_eq!(controller.snapshot().len(), 3);

        controller.start_session(None).await.unwrap();
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, GREETING);
        assert!(controller.history().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_send_releases_loading() {
        let (controller, provider) = controller_with(ControllerConfig {
            stream_timeout: None,
            ..ControllerConfig::default()
        });
        controller.start_session(None).await.unwrap();
        provider.queue_pending();

        let mut events = controller.subscribe();
        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("hello").await }
        });
        let placeholder = await_placeholder(&mut events).await;
        assert!(controller.is_loading());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!controller.is_loading());
        let snapshot = controller.snapshot();
        assert!(snapshot.iter().all(|m| m.id != placeholder));
        assert_eq!(snapshot.last().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_missing_credential_never_connects() {
        let connects = Arc::new(AtomicUsize::new(0));
        for credential in [None, Some(String::new()), Some("   ".to_string())] {
            let counter = Arc::clone(&connects);
            let controller = SessionController::new(
                credential,
                move |_key| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(ScriptedProvider::new()) as Arc<dyn Provider>)
                },
                ControllerConfig::default(),
            );

            assert!(controller.credential_missing());
            assert!(matches!(
                controller.start_session(None).await,
                Err(ControllerError::CredentialMissing)
            ));
            assert!(matches!(
                controller.send("hello").await,
                Err(ControllerError::CredentialMissing)
            ));
            assert!(!controller.has_session());
            assert!(controller.snapshot().is_empty());
        }
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_credential_is_passed_to_connector() {
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        let controller = SessionController::new(
            Some("key-123".to_string()),
            move |key| {
                *captured.lock().unwrap() = Some(key.to_string());
                Ok(Arc::new(ScriptedProvider::new()) as Arc<dyn Provider>)
            },
            ControllerConfig::default(),
        );

        assert!(!controller.credential_missing());
        controller.start_session(None).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("key-123"));
    }

    #[tokio::test]
    async fn test_session_creation_failure_is_reported() {
        let controller = SessionController::new(
            Some("key".to_string()),
            |_key| Err(Error::config("invalid base URL")),
            ControllerConfig::default(),
        );
        assert!(matches!(
            controller.start_session(None).await,
            Err(ControllerError::SessionCreationFailed(Error::Config(_)))
        ));
        assert!(!controller.has_session());
        assert!(matches!(
            controller.send("hi").await,
            Err(ControllerError::NoSession)
        ));

        assert!(matches!(
            controller.start_session(find_topic("dp")).await,
            Err(ControllerError::SessionCreationFailed(_))
        ));
        assert!(controller.active_topic().is_none());
        assert!(!controller.has_session());
        assert!(!controller.is_loading());
        assert_eq!(controller.phase(), Phase::Idle);

        let (controller, _) = controller_with(ControllerConfig {
            temperature: 3.5,
            ..ControllerConfig::default()
        });
        assert!(matches!(
            controller.start_session(find_topic("heap")).await,
            Err(ControllerError::SessionCreationFailed(_))
        ));
        assert!(controller.snapshot().is_empty());
        assert!(controller.active_topic().is_none());
    }

    #[tokio::test]
    async fn test_failed_topic_switch_clears_previous_topic() {
        let fail = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(ScriptedProvider::new());
        let controller = {
            let fail = Arc::clone(&fail);
            let provider = Arc::clone(&provider);
            SessionController::new(
                Some("key".to_string()),
                move |_key| {
                    if fail.load(Ordering::SeqCst) {
                        Err(Error::network("connection refused"))
                    } else {
                        Ok(Arc::clone(&provider) as Arc<dyn Provider>)
                    }
                },
                ControllerConfig::default(),
            )
        };

        provider.queue_fragments(["스택은 LIFO입니다."]);
        controller.start_session(find_topic("stack_queue")).await.unwrap();
        assert_eq!(controller.active_topic().map(|t| t.id), Some("stack_queue"));

        fail.store(true, Ordering::SeqCst);
        assert!(controller.start_session(find_topic("dp")).await.is_err());
        assert!(controller.active_topic().is_none());
        assert!(controller.snapshot().is_empty());
    }
}
