#![forbid(unsafe_code)]

mod schema;

pub(super) use schema::*;
