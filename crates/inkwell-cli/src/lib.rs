//! Command-line front end for the Inkwell note-save engine

pub mod commands;
pub mod config;

pub use config::{Cli, Command};
