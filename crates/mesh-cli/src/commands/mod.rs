//! Subcommand implementations.

pub mod info;
pub mod init_config;
pub mod register;
