//! Process-level glue: signal handling and the periodic pass loop.

pub mod schedule;
pub mod shutdown;
