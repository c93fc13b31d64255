//! # collab-relay: WebSocket relay for collaborative documents
//!
//! Clients speak the y-websocket binary protocol. The relay keeps one
//! authoritative CRDT replica and one awareness table per named document,
//! answers sync handshakes and forwards every accepted change to the other
//! connections on the same document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ws://host/<doc>   ┌─────────────┐      ┌──────────────────┐
//! │ Client   │ ◄─────────────────► │ Dispatcher  │ ───► │ SharedDocument   │
//! │ (per     │    Binary frames    │ (per conn)  │      │  ├ ReplicaEngine │
//! │  socket) │                     └─────────────┘      │  ├ Awareness     │
//! └──────────┘                                          │  └ Connections   │
//!                                                       └────────┬─────────┘
//!                                                                │
//!                                                        ┌───────┴───────┐
//!                                                        │ Broadcaster   │
//!                                                        │ (fan-out)     │
//!                                                        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: frame decoding and encoding
//! - [`awareness`]: last-writer-wins presence table
//! - [`replica`]: CRDT replica seam backed by yrs
//! - [`connection`]: outbound handles and awareness ownership
//! - [`broadcast`]: best-effort fan-out
//! - [`document`]: per-document state behind one guard
//! - [`registry`]: name to document map with idle eviction
//! - [`dispatcher`]: per-connection frame handling
//! - [`server`]: WebSocket listener and connection tasks

pub mod error;
pub mod protocol;
pub mod awareness;
pub mod payload;
pub mod replica;
pub mod connection;
pub mod broadcast;
pub mod document;
pub mod registry;
pub mod dispatcher;
pub mod server;

// Re-exports for convenience
pub use error::{RelayError, Result};
pub use protocol::{AuthMessage, Frame, MessageType};
pub use awareness::{AwarenessChange, AwarenessEntry, AwarenessTable, ParticipantId};
pub use replica::{ReplicaEngine, YrsReplica};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionSet, OutboundFrame};
pub use broadcast::{BroadcastStats, Broadcaster, Fanout};
pub use document::{DocumentState, SharedDocument};
pub use registry::DocumentRegistry;
pub use dispatcher::{AuthHook, Dispatched, Dispatcher, LogOnlyAuth};
pub use server::{RelayServer, ServerConfig, ServerStats};
