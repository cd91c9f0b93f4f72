// SPDX-License-Identifier: MIT

pub mod loader;
pub mod types;
pub mod validator;

pub use loader::WorkflowLoader;
pub use types::*;
pub use validator::Validator;
