//! HTTP handlers for the REST surface. The WebSocket upgrade lives in
//! `crate::websocket`.

pub mod config;
pub mod sessions;
pub mod tts;

pub use config::*;
pub use sessions::*;
pub use tts::*;
