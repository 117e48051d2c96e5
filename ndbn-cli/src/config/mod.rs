//! Configuration files read by the CLI.

pub mod compile_config;
