//! QAWave Adapter Implementations
//!
//! Concrete implementations of the `qw-ports` traits:
//! - `MemoryStore`: in-process persistence for tests and embedders
//! - `ReqwestGateway`: outbound HTTP to the system under test
//! - `HttpAiProvider`: chat-completions language model client
//! - `NatsEventPublisher` / `NoopBus`: the best-effort journal feed

pub mod ai;
pub mod http;
pub mod memory;
pub mod nats;

pub use ai::{AiProviderConfig, HttpAiProvider};
pub use http::ReqwestGateway;
pub use memory::MemoryStore;
pub use nats::{NatsConfig, NatsEventPublisher, NoopBus};
