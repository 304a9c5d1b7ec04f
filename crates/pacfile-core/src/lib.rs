//! Package metadata model, block parser and query primitives shared by the
//! pacfile index and command line.

pub mod config;
pub mod matcher;
pub mod parse;
pub mod query;
pub mod record;
