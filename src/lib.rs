// SPDX-License-Identifier: MIT

//! agentrun: load a declarative agent workflow, resolve its resource graph,
//! and execute the target resource, one-shot or behind an HTTP API.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod server;
pub mod session;
pub mod workflow;

pub use config::AppConfig;
pub use engine::{Engine, ExecutionOutput, RequestContext};
pub use error::{EngineError, ErrorKind};
pub use executor::ExecutorRegistry;
pub use workflow::{Validator, Workflow, WorkflowLoader};
