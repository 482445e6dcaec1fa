#![forbid(unsafe_code)]

mod jobs;
mod queue;

pub use jobs::*;
pub use queue::*;
