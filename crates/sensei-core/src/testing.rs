//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::Error;
use crate::message::StreamChunk;
use crate::provider::{CompletionRequest, Provider, StreamResult};

enum Script {
    Chunks(Vec<Result<StreamChunk, Error>>),
    Live(mpsc::UnboundedReceiver<Result<StreamChunk, Error>>),
    Pending,
    Reject(Error),
}

/// Feeds a live scripted stream from the test body. Dropping it ends the
/// stream.
pub struct ScriptSender {
    tx: mpsc::UnboundedSender<Result<StreamChunk, Error>>,
}

impl ScriptSender {
    /// Push a text fragment. Returns false once the consumer is gone.
    pub fn fragment(&self, text: &str) -> bool {
        self.tx
            .send(Ok(StreamChunk::Delta {
                content: text.to_string(),
            }))
            .is_ok()
    }

    /// Push a transport error.
    pub fn fail(&self, message: &str) -> bool {
        self.tx.send(Err(Error::network(message))).is_ok()
    }
}

/// A provider whose replies are scripted ahead of time. Each `stream()` call
/// consumes the oldest queued script.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "scripted".to_string(),
        }
    }

    /// Queue a reply made of the given fragments followed by `Done`.
    pub fn queue_fragments<'a>(&self, fragments: impl IntoIterator<Item = &'a str>) {
        let mut chunks: Vec<Result<StreamChunk, Error>> = fragments
            .into_iter()
            .map(|f| {
                Ok(StreamChunk::Delta {
                    content: f.to_string(),
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk::Done { usage: None }));
        self.push(Script::Chunks(chunks));
    }

    /// Queue raw stream items.
    pub fn queue_chunks(&self, chunks: Vec<Result<StreamChunk, Error>>) {
        self.push(Script::Chunks(chunks));
    }

    /// Queue a reply whose fragments are pushed by the test while the
    /// request is in flight.
    pub fn queue_live(&self) -> ScriptSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Live(rx));
        ScriptSender { tx }
    }

    /// Queue a reply that never produces a fragment.
    pub fn queue_pending(&self) {
        self.push(Script::Pending);
    }

    /// Queue a request that fails before streaming starts.
    pub fn queue_rejection(&self, error: Error) {
        self.push(Script::Reject(error));
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn next_script(&self, request: CompletionRequest) -> Result<Script, Error> {
        self.captured_requests.lock().unwrap().push(request);
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Unknown("No scripted response queued".to_string()))
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        match self.next_script(request)? {
            Script::Chunks(chunks) => Ok(Box::pin(futures::stream::iter(chunks)) as StreamResult),
            Script::Live(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx)) as StreamResult),
            Script::Pending => Ok(Box::pin(futures::stream::pending::<Result<StreamChunk, Error>>())
                as StreamResult),
            Script::Reject(error) => Err(error),
        }
    }
}
