//! sensei-core: Core types for the sensei algorithm tutor
//!
//! This crate holds everything that does not touch a terminal or the
//! network: the reply segment parser, the transcript store, the chat
//! session and the controller that drives replies into the transcript.

pub mod controller;
pub mod curriculum;
pub mod error;
pub mod message;
pub mod provider;
pub mod segment;
pub mod session;
pub mod transcript;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::{ControllerConfig, ControllerError, Phase, SendOutcome, SessionController};
pub use curriculum::{find_topic, Topic, TOPICS};
pub use error::Error;
pub use message::{ChatMessage, Role, StreamChunk, Usage};
pub use provider::{CompletionRequest, Provider, StreamResult};
pub use segment::{Inline, Segment, Segments};
pub use session::{ChatSession, FragmentStream, SessionConfig};
pub use transcript::{
    Message, MessageId, MessageIdGen, PatchOutcome, TranscriptEvent, TranscriptStore,
};

pub type Result<T> = std::result::Result<T, Error>;
