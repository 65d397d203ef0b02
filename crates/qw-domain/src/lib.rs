//! QAWave Domain Core
//!
//! Pure domain logic for the QA run pipeline:
//! - Run lifecycle entities and the run status state machine
//! - Scenarios, steps, expectations, and the scenario JSON contract
//! - Assertion token and response locator ASTs (decoded once at load time)
//! - The append-only run event journal records
//! - Coverage and summary report types
//! - OpenAPI operation enumeration and spec hashing
//!
//! This crate must not import DB clients, HTTP frameworks, or LLM SDKs;
//! all I/O lives behind the port traits in `qw-ports`.

pub mod assertion;
pub mod contract;
pub mod coverage;
pub mod errors;
pub mod events;
pub mod locator;
pub mod openapi;
pub mod outcome;
pub mod run;
pub mod scenario;
pub mod state_machine;

pub use assertion::*;
pub use contract::*;
pub use coverage::*;
pub use errors::*;
pub use events::*;
pub use locator::*;
pub use openapi::*;
pub use outcome::*;
pub use run::*;
pub use scenario::*;
pub use state_machine::*;
