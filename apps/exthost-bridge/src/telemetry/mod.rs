//! Process-wide diagnostics setup shared by both binaries.

pub mod logging;
