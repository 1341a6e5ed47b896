//! mesh init-config command - write a registration configuration file.

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use mesh_registration::RegistrationParams;

use crate::{Cli, output};

#[derive(Clone, Copy, ValueEnum)]
pub enum Preset {
    /// Coarse graph and fewer iterations
    Fast,
    /// Denser graph, slower annealing, tighter tolerances
    Accurate,
}

pub fn run(output_path: Option<&Path>, preset: Option<Preset>, cli: &Cli) -> Result<()> {
    let params = match preset {
        Some(Preset::Fast) => RegistrationParams::fast(),
        Some(Preset::Accurate) => RegistrationParams::accurate(),
        None => RegistrationParams::default(),
    };

    match output_path {
        Some(path) => {
            params
                .save_toml(path)
                .with_context(|| format!("Failed to write configuration to {:?}", path))?;
            output::success(
                &format!("Configuration written to {}", path.display()),
                cli.format,
                cli.quiet,
            );
        }
        None => {
            let text = params.to_toml()?;
            print!("{}", text);
        }
    }

    Ok(())
}
