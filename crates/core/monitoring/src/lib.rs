//! Process-wide observability setup shared by every crate of the sink.

pub mod logging;
