//! Output helpers shared by the subcommands.

use colored::Colorize;
use serde::Serialize;

use crate::OutputFormat;

/// Print a serializable result: pretty JSON in json mode, one line otherwise.
pub fn print<T: Serialize>(value: &T, format: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}: failed to serialize output: {}", "Error".red().bold(), e),
        },
        OutputFormat::Text => match serde_json::to_string(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}: failed to serialize output: {}", "Error".red().bold(), e),
        },
    }
}

/// Print a success line in text mode.
pub fn success(message: &str, format: OutputFormat, quiet: bool) {
    if quiet || matches!(format, OutputFormat::Json) {
        return;
    }
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning line in text mode.
pub fn warning(message: &str, format: OutputFormat, quiet: bool) {
    if quiet || matches!(format, OutputFormat::Json) {
        return;
    }
    eprintln!("{} {}", "!".yellow().bold(), message);
}
