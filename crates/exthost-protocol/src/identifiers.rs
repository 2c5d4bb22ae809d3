//! Stable proxy identifier names.
//!
//! `MainThread*` names are implemented by the IDE host, `ExtHost*` names by the
//! extension runtime. Renaming one is a breaking protocol change for both sides.

pub const PING: &str = "Ping";
pub const EXT_HOST_PING: &str = "ExtHostPing";
pub const MAIN_THREAD_CONSOLE: &str = "MainThreadConsole";

pub const ALL: &[&str] = &[PING, EXT_HOST_PING, MAIN_THREAD_CONSOLE];
