//! sensei-providers: model provider implementations for sensei
//!
//! This crate implements the `Provider` trait for the Gemini streaming API.

pub mod gemini;

pub use gemini::{GeminiProvider, DEFAULT_BASE_URL};
