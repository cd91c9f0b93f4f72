// SPDX-License-Identifier: MIT

//! Resource dependency graph
//!
//! Builds the static graph of which resources read which others and turns
//! it into an execution order for a target.

mod resolver;

pub use resolver::{resolve_order, DependencyGraph};
