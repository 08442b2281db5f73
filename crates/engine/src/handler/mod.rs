//! Task execution logic
//!
//! - [`TaskHandler`] - async execution logic for one task type
//! - [`HandlerRegistry`] - lookup by task type with an echo fallback
//! - [`builtin`] - demo handlers with simulated latency

pub mod builtin;
mod registry;

pub use registry::{
    EchoHandler, HandlerError, HandlerRegistry, HandlerResult, TaskHandler, TaskInvocation,
};
