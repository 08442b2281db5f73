//! Task data model
//!
//! - [`Task`] - the durable record of one unit of work
//! - [`TaskStatus`] - lifecycle state
//! - [`TaskUpdate`] - the fields written by a single status transition

mod model;

pub use model::{NewTask, ParseStatusError, Task, TaskStatus, TaskUpdate};
