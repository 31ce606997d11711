mod config;
mod pattern;
pub mod snmp;
mod telnet;
mod terminal;

pub use pattern::FullMatch;
pub use terminal::{Protocol, Terminal, TerminalError};
