//! mesh register command - deform a source mesh onto a target mesh.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use mesh_registration::{NonRigidRegistration, RegistrationParams};
use serde::Serialize;

use crate::commands::init_config::Preset;
use crate::{Cli, OutputFormat, output};

#[derive(Args)]
pub struct RegisterArgs {
    /// Source mesh (deformed)
    source: PathBuf,

    /// Target mesh (fixed)
    target: PathBuf,

    /// Output file path (format determined by extension)
    #[arg(short, long)]
    output: PathBuf,

    /// Landmark pairs, one `source target` index pair per line
    #[arg(long)]
    landmarks: Option<PathBuf>,

    /// TOML configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start from a preset instead of the defaults
    #[arg(long, value_enum, conflicts_with = "config")]
    preset: Option<Preset>,

    /// Weight of the rotation smoothness term
    #[arg(long)]
    alpha: Option<f64>,

    /// Weight of the translation smoothness term
    #[arg(long)]
    beta: Option<f64>,

    /// Weight of the landmark term
    #[arg(long)]
    gamma: Option<f64>,

    /// Deformation graph nodes as a percentage of source vertices
    #[arg(long)]
    sample_ratio: Option<f64>,

    /// Keep far correspondences
    #[arg(long)]
    no_distance_reject: bool,

    /// Maximum correspondence distance (normalized units)
    #[arg(long)]
    distance_threshold: Option<f64>,

    /// Reject correspondences with diverging normals
    #[arg(long)]
    normal_reject: bool,

    /// Maximum normal angle in radians (enables normal rejection)
    #[arg(long)]
    normal_threshold: Option<f64>,

    /// Keep the robust scale fixed instead of annealing it
    #[arg(long)]
    fixed_nu: bool,

    /// Write the ground-truth error report to this file
    #[arg(long)]
    gt_error: Option<PathBuf>,

    /// Skip ground-truth error tracking
    #[arg(long, conflicts_with_all = ["gt_error", "gt_mesh"])]
    no_gt_error: bool,

    /// Ground-truth mesh (defaults to the target)
    #[arg(long)]
    gt_mesh: Option<PathBuf>,
}

impl RegisterArgs {
    fn params(&self) -> Result<RegistrationParams> {
        let mut params = match (&self.config, self.preset) {
            (Some(path), _) => RegistrationParams::from_toml_file(path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?,
            (None, Some(Preset::Fast)) => RegistrationParams::fast(),
            (None, Some(Preset::Accurate)) => RegistrationParams::accurate(),
            (None, None) => RegistrationParams::default(),
        };

        if let Some(alpha) = self.alpha {
            params = params.with_alpha(alpha);
        }
        if let Some(beta) = self.beta {
            params = params.with_beta(beta);
        }
        if let Some(gamma) = self.gamma {
            params = params.with_gamma(gamma);
        }
        if let Some(ratio) = self.sample_ratio {
            params = params.with_sample_ratio(ratio);
        }
        if let Some(threshold) = self.distance_threshold {
            params = params.with_distance_threshold(threshold);
        }
        if self.no_distance_reject {
            params = params.with_distance_reject(false);
        }
        if self.normal_reject {
            params = params.with_normal_reject(true);
        }
        if let Some(threshold) = self.normal_threshold {
            params = params.with_normal_threshold(threshold);
        }
        if self.fixed_nu {
            params = params.with_dynamic_nu(false);
        }
        if let Some(path) = &self.gt_error {
            params = params.with_gt_error(Some(path.clone()));
        }
        if let Some(path) = &self.gt_mesh {
            params = params.with_gt_mesh(path.clone());
        }
        if self.no_gt_error {
            params = params.without_gt_error();
        }

        params.validate()?;
        Ok(params)
    }
}

#[derive(Serialize)]
struct RegisterResult {
    source: String,
    target: String,
    output: String,
    success: bool,
    rigid_iterations: usize,
    nonrigid_iterations: usize,
    nu_levels: usize,
    converged: bool,
    final_energy: f64,
    singular_nodes: usize,
    rms_residual: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    gt_rms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gt_max: Option<f64>,
    timing_ms: Vec<PhaseTiming>,
    total_ms: f64,
}

#[derive(Serialize)]
struct PhaseTiming {
    phase: &'static str,
    ms: Option<f64>,
}

pub fn run(args: &RegisterArgs, cli: &Cli) -> Result<()> {
    let params = args.params()?;

    let mut registration = NonRigidRegistration::new();
    registration.set_parameters(params);
    let report = registration.try_register_meshes(
        &args.source,
        &args.target,
        &args.output,
        args.landmarks.as_deref(),
    )?;

    let timing = registration.timing();
    let result = RegisterResult {
        source: args.source.display().to_string(),
        target: args.target.display().to_string(),
        output: args.output.display().to_string(),
        success: true,
        rigid_iterations: report.rigid.iterations,
        nonrigid_iterations: report.nonrigid.iterations,
        nu_levels: report.nonrigid.levels,
        converged: report.nonrigid.converged,
        final_energy: report.nonrigid.final_energy,
        singular_nodes: report.nonrigid.singular_nodes,
        rms_residual: report.rms_residual,
        gt_rms: report.gt_error.map(|e| e.rms),
        gt_max: report.gt_error.map(|e| e.max),
        timing_ms: timing
            .phases()
            .iter()
            .map(|&(phase, d)| PhaseTiming {
                phase,
                ms: d.map(|d| d.as_secs_f64() * 1000.0),
            })
            .collect(),
        total_ms: timing.total().as_secs_f64() * 1000.0,
    };

    match cli.format {
        OutputFormat::Json => {
            output::print(&result, cli.format, cli.quiet);
        }
        OutputFormat::Text => {
            if !cli.quiet {
                output::success(
                    &format!("Registered mesh saved to {}", args.output.display()),
                    cli.format,
                    cli.quiet,
                );
                for line in report.to_string().lines() {
                    println!("  {}", line);
                }
                println!("{}", "Timing".bold().underline());
                for line in registration.timing_info().lines() {
                    println!("  {}", line);
                }
                if !report.nonrigid.converged {
                    output::warning(
                        "Non-rigid stage stopped at its iteration budget",
                        cli.format,
                        cli.quiet,
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Commands;
    use clap::Parser;

    fn parse(extra: &[&str]) -> RegisterArgs {
        let mut argv = vec!["mesh", "register", "a.obj", "b.obj", "-o", "c.obj"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Register(args) => args,
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let params = parse(&[
            "--alpha",
            "5",
            "--no-distance-reject",
            "--normal-threshold",
            "0.5",
            "--fixed-nu",
        ])
        .params()
        .unwrap();
        assert_eq!(params.alpha, 5.0);
        assert!(!params.use_distance_reject);
        assert!(params.use_normal_reject);
        assert_eq!(params.normal_threshold, 0.5);
        assert!(!params.use_dynamic_nu);
        assert_eq!(params.beta, RegistrationParams::default().beta);
    }

    #[test]
    fn test_invalid_flag_values_are_rejected() {
        assert!(parse(&["--alpha=-1"]).params().is_err());
        assert!(parse(&["--sample-ratio", "0"]).params().is_err());
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reg.toml");
        RegistrationParams::default()
            .with_gamma(42.0)
            .save_toml(&path)
            .unwrap();
        let params = parse(&["--config", path.to_str().unwrap(), "--beta", "3"])
            .params()
            .unwrap();
        assert_eq!(params.gamma, 42.0);
        assert_eq!(params.beta, 3.0);
    }

    #[test]
    fn test_gt_error_tracking_can_be_switched_off() {
        assert!(parse(&[]).params().unwrap().calc_gt_err);
        let params = parse(&["--no-gt-error"]).params().unwrap();
        assert!(!params.calc_gt_err);
        assert!(params.out_gt_file.is_none());

        let argv = [
            "mesh", "register", "a.obj", "b.obj", "-o", "c.obj", "--no-gt-error", "--gt-error",
            "gt.txt",
        ];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_preset_conflicts_with_config() {
        let argv = [
            "mesh", "register", "a.obj", "b.obj", "-o", "c.obj", "--config", "x.toml", "--preset",
            "fast",
        ];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
