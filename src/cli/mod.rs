//! Command line interface of the `xiphos` inspection tool.

pub mod args;
pub mod commands;
pub mod output;

pub use args::{Command, XiphosArgs};
pub use commands::execute_command;
