//! CLI module for signal-courier - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running workers,
//! enqueueing messages and inspecting the backlogs.

pub mod commands;

pub use commands::Cli;
