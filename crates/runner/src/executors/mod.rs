#![forbid(unsafe_code)]

//! Out-of-process adapters for the stage and reply contracts.
//!
//! Each adapter runs one configured command per call: the request goes to the
//! child's stdin as JSON and one JSON envelope is read back from stdout.

pub(crate) mod command;
pub(crate) mod reply;
pub(crate) mod stages;

pub(crate) use command::CommandSpec;
pub(crate) use reply::CommandReplyDelivery;
pub(crate) use stages::CommandStage;
