//! Worker runtime
//!
//! A worker wraps exactly one model (or one stateful capability such as a
//! vector store) behind the capability surface in [`backend`].
//!
//! Architecture:
//! - `backend`: the [`Backend`] trait, every capability defaulting to unimplemented
//! - `runtime`: locking discipline and streaming, shared by every access path
//! - `server`: HTTP/JSON wire listener in front of a runtime
//! - `client` / `embedded`: the two interchangeable [`WorkerClient`] views
//! - `registry`: address → embedded worker lookup

pub mod backend;
pub mod client;
pub mod context;
pub mod embedded;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod store_client;

pub use backend::{Backend, ConcurrencyMode, TokenSender};
pub use client::{NetworkClient, WorkerClient, HEALTH_CHECK_TIMEOUT};
pub use context::{CallContext, CancelOnDrop, CancelToken};
pub use embedded::EmbeddedClient;
pub use runtime::{ReplyStream, WorkerRuntime, DEFAULT_STREAM_QUEUE};
