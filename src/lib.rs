//! Offline resilience layer for the Dialtone voice notes client.
//!
//! The client records audio and hands it to a backend for transcription,
//! summarization, and vault persistence. Connectivity to that backend is not
//! under the client's control, so this crate keeps the application usable
//! when the network is unreliable:
//! - Per-route caching strategies serve response snapshots for reads
//! - A durable queue captures mutations that could not be delivered and
//!   replays them with retry/backoff once the network returns
//! - A sync coordinator decides when the queue is flushed
//! - A lifecycle manager governs versioned handoff of the layer itself
//!
//! The hosting application interacts only through the component APIs: it
//! submits requests via [`agent::Agent::intercept`], injects platform
//! signals through [`event::Event`], and observes [`sync::StatusUpdate`]
//! messages. Persistent state never leaks out as raw storage handles.

pub mod agent;
pub mod cache;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod net;
pub mod queue;
pub mod store;
pub mod sync;
