//! mesh info command - display mesh statistics.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use mesh_registration::Mesh;
use serde::Serialize;

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct MeshInfo {
    path: String,
    vertices: usize,
    faces: usize,
    edges: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    bounds: Option<BoundsInfo>,
    bounding_diagonal: f64,
    mean_edge_length: f64,
    isolated_vertices: usize,
    degenerate_faces: usize,
    has_normals: bool,
}

#[derive(Serialize)]
struct BoundsInfo {
    min: [f64; 3],
    max: [f64; 3],
    dimensions: [f64; 3],
}

pub fn run(input: &Path, cli: &Cli) -> Result<()> {
    let mesh =
        Mesh::load(input).with_context(|| format!("Failed to load mesh from {:?}", input))?;
    let report = mesh.report();

    let bounds = report.bounds.map(|(min, max)| {
        let dims = max - min;
        BoundsInfo {
            min: [min.x, min.y, min.z],
            max: [max.x, max.y, max.z],
            dimensions: [dims.x, dims.y, dims.z],
        }
    });

    let info = MeshInfo {
        path: input.display().to_string(),
        vertices: report.vertex_count,
        faces: report.face_count,
        edges: report.edge_count,
        bounds,
        bounding_diagonal: report.bounding_diagonal,
        mean_edge_length: report.mean_edge_length,
        isolated_vertices: report.isolated_vertices,
        degenerate_faces: report.degenerate_faces,
        has_normals: mesh.vertices.iter().any(|v| v.normal.is_some()),
    };

    match cli.format {
        OutputFormat::Json => {
            output::print(&info, cli.format, cli.quiet);
        }
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Mesh Information".bold().underline());
                println!("  {}: {}", "File".cyan(), input.display());
                println!("  {}: {}", "Vertices".cyan(), info.vertices);
                println!("  {}: {}", "Faces".cyan(), info.faces);
                println!("  {}: {}", "Edges".cyan(), info.edges);

                if let Some(ref b) = info.bounds {
                    println!(
                        "  {}: {:.4} x {:.4} x {:.4}",
                        "Dimensions".cyan(),
                        b.dimensions[0],
                        b.dimensions[1],
                        b.dimensions[2]
                    );
                    println!(
                        "  {}: ({:.4}, {:.4}, {:.4})",
                        "Min bounds".cyan(),
                        b.min[0],
                        b.min[1],
                        b.min[2]
                    );
                    println!(
                        "  {}: ({:.4}, {:.4}, {:.4})",
                        "Max bounds".cyan(),
                        b.max[0],
                        b.max[1],
                        b.max[2]
                    );
                }
                println!("  {}: {:.6}", "Bounding diagonal".cyan(), info.bounding_diagonal);
                println!("  {}: {:.6}", "Mean edge length".cyan(), info.mean_edge_length);
                println!(
                    "  {}: {}",
                    "Has normals".cyan(),
                    if info.has_normals { "yes" } else { "no" }
                );

                if info.isolated_vertices > 0 {
                    output::warning(
                        &format!("{} vertices are not used by any face", info.isolated_vertices),
                        cli.format,
                        cli.quiet,
                    );
                }
                if info.degenerate_faces > 0 {
                    output::warning(
                        &format!("{} faces have zero area", info.degenerate_faces),
                        cli.format,
                        cli.quiet,
                    );
                }
            }
        }
    }

    Ok(())
}
