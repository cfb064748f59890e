//! # Streaming Relay Core
//!
//! Pairs one client socket with one upstream recognition connection and relays
//! audio one way and transcript events the other, until either side ends.
//!
//! ## Key Components:
//! - **Session** (`session`): lifecycle state and the negotiated format
//! - **Upstream handle** (`upstream`): send / results / close over any vendor
//! - **Deepgram connector** (`deepgram`): the production upstream
//! - **Relay loop** (`relay_loop`): the two concurrent directions of one session
//! - **Registry** (`registry`): live sessions, for status and forced shutdown
//! - **Teardown** (`teardown`): exactly-once release of every resource
//!
//! The socket side is abstracted behind `client::ClientSink` and
//! `client::ClientFeed`; `crate::websocket` provides the actix implementation.

pub mod client;      // Client-side sink/feed abstraction
pub mod deepgram;    // Deepgram live-listen connector
pub mod driver;      // Per-session state machine driver
pub mod error;       // Session error taxonomy
pub mod event;       // Transcript events and client control messages
pub mod format;      // Handshake parsing and negotiated format
pub mod queue;       // Bounded outbound queue with interim shedding
pub mod registry;    // Live session registry
pub mod relay_loop;  // Bidirectional relay loop
pub mod session;     // Session record and state machine
pub mod teardown;    // Guaranteed release policy
pub mod upstream;    // Upstream handle contract

#[cfg(test)]
pub mod testing;

pub use client::{client_channel, ClientClose, ClientFeed, ClientFrame, ClientGone, ClientHandle, ClientSink};
pub use deepgram::DeepgramConnector;
pub use driver::{SessionDriver, SessionSettings};
pub use event::TranscriptEvent;
pub use registry::{RegistryError, SessionRegistry};
pub use session::Session;
pub use upstream::UpstreamConnector;
