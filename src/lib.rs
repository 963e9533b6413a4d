//! Weft is a workflow orchestration core: templates describe steps and
//! nested workflows, runs instantiate them, and multidimensional data
//! trees carry values between them with scatter/gather semantics.
//!
//! The crate is storage- and execution-agnostic. Persistence goes through
//! the [`store::Store`] trait (an in-memory implementation ships as
//! [`store::MemoryStore`]) and task execution through the
//! [`manager::TaskManager`] trait. [`engine::Engine`] ties the two
//! together and owns all orchestration logic: run instantiation, channel
//! wiring, data propagation, task creation, and status aggregation.
//!
//! Concurrent writers are handled optimistically: every record carries a
//! version, and mutations go through [`guard::save_with_retries`], which
//! retries on conflict a bounded number of times.

pub mod channel;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod guard;
pub mod ids;
pub mod manager;
pub mod run;
pub mod store;
pub mod task;
pub mod template;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{Engine, RunInput, RunRequest, RunView, TaskView};
pub use error::{DataError, EngineError, EngineResult, SaveError, StoreError, ValidationError};
pub use store::MemoryStore;
