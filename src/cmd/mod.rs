//! CLI subcommand implementations
//!
//! Each module owns one subcommand: argument struct (clap derive) plus an
//! async `run` returning the process exit code. Error-to-exit-code mapping
//! for failures happens in `main`.

pub mod addons;
pub mod delete;
pub mod kubectl;
pub mod node;
pub mod profile;
pub mod ssh;
pub mod start;
pub mod status;
pub mod stop;
