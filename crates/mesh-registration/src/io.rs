//! Mesh and landmark file I/O.
//!
//! Meshes are read and written as OBJ (`tobj`), PLY (`ply-rs`, ASCII or
//! binary) or STL (`stl_io`), chosen by file extension. Landmark files are
//! plain text with one `source target` vertex index pair per line.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::landmark::Landmarks;
use crate::types::{Mesh, Vertex};
use crate::validate::validate_mesh_data;

/// Supported mesh file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Stl,
    Obj,
    Ply,
}

impl MeshFormat {
    /// Detect format from file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .and_then(|ext| match ext.as_str() {
                "stl" => Some(MeshFormat::Stl),
                "obj" => Some(MeshFormat::Obj),
                "ply" => Some(MeshFormat::Ply),
                _ => None,
            })
    }

    fn detect(path: &Path) -> MeshResult<Self> {
        Self::from_path(path).ok_or_else(|| MeshError::UnsupportedFormat {
            extension: path.extension().and_then(|e| e.to_str()).map(String::from),
        })
    }
}

/// Load a mesh from file, auto-detecting format from extension.
///
/// The mesh must have at least one vertex and one face, finite coordinates
/// and in-range face indices.
pub fn load_mesh(path: &Path) -> MeshResult<Mesh> {
    let format = MeshFormat::detect(path)?;
    info!(target: "mesh_registration::io", ?path, ?format, "Loading mesh");

    let mesh = match format {
        MeshFormat::Stl => load_stl(path)?,
        MeshFormat::Obj => load_obj(path)?,
        MeshFormat::Ply => load_ply(path)?,
    };

    if mesh.vertices.is_empty() || mesh.faces.is_empty() {
        return Err(MeshError::empty_mesh(format!(
            "{} has {} vertices and {} faces",
            path.display(),
            mesh.vertex_count(),
            mesh.face_count()
        )));
    }

    validate_mesh_data(&mesh)?;

    info!(
        target: "mesh_registration::io",
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        "Loaded mesh"
    );
    if let Some((min, max)) = mesh.bounds() {
        debug!(
            target: "mesh_registration::io",
            "Bounding box: [{:.4}, {:.4}, {:.4}] to [{:.4}, {:.4}, {:.4}]",
            min.x, min.y, min.z, max.x, max.y, max.z
        );
    }

    Ok(mesh)
}

/// Load mesh from STL file (binary or ASCII).
fn load_stl(path: &Path) -> MeshResult<Mesh> {
    let file = File::open(path).map_err(|e| MeshError::io_read(path, e))?;
    let mut reader = BufReader::new(file);

    let stl =
        stl_io::read_stl(&mut reader).map_err(|e| MeshError::parse_error(path, e.to_string()))?;

    let mut mesh = Mesh::with_capacity(stl.vertices.len(), stl.faces.len());
    for v in &stl.vertices {
        mesh.vertices.push(Vertex::from_coords(
            v.0[0] as f64,
            v.0[1] as f64,
            v.0[2] as f64,
        ));
    }

    let mut skipped = 0usize;
    for face in &stl.faces {
        let [a, b, c] = face.vertices;
        // Collapsed triangles carry no surface for correspondence queries.
        if a != b && b != c && a != c {
            mesh.faces.push([a as u32, b as u32, c as u32]);
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        debug!(target: "mesh_registration::io", skipped, "Dropped collapsed STL triangles");
    }

    Ok(mesh)
}

/// Load mesh from OBJ file, merging all models.
fn load_obj(path: &Path) -> MeshResult<Mesh> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| match e {
        tobj::LoadError::OpenFileFailed => MeshError::io_read(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "cannot open OBJ file"),
        ),
        other => MeshError::parse_error(path, other.to_string()),
    })?;

    let mut mesh = Mesh::new();
    for model in &models {
        let offset = mesh.vertices.len() as u32;
        let obj_mesh = &model.mesh;

        mesh.vertices.extend(
            obj_mesh
                .positions
                .chunks_exact(3)
                .map(|c| Vertex::from_coords(c[0] as f64, c[1] as f64, c[2] as f64)),
        );
        mesh.faces.extend(
            obj_mesh
                .indices
                .chunks_exact(3)
                .map(|c| [c[0] + offset, c[1] + offset, c[2] + offset]),
        );
    }

    debug!(
        target: "mesh_registration::io",
        models = models.len(),
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        "OBJ parsed"
    );
    Ok(mesh)
}

/// Load mesh from PLY file (ASCII or binary).
///
/// Expects `vertex` elements with `x`, `y`, `z` and `face` elements with a
/// `vertex_indices` (or `vertex_index`) list. Polygons are fan-triangulated.
fn load_ply(path: &Path) -> MeshResult<Mesh> {
    use ply_rs::parser::Parser;
    use ply_rs::ply::{DefaultElement, Property};

    let file = File::open(path).map_err(|e| MeshError::io_read(path, e))?;
    let mut reader = BufReader::new(file);

    let ply = Parser::<DefaultElement>::new()
        .read_ply(&mut reader)
        .map_err(|e| MeshError::parse_error(path, format!("PLY parse error: {}", e)))?;

    let mut mesh = Mesh::new();

    if let Some(vertices) = ply.payload.get("vertex") {
        mesh.vertices.reserve(vertices.len());
        for element in vertices {
            let x = ply_scalar(element.get("x"), "x", path)?;
            let y = ply_scalar(element.get("y"), "y", path)?;
            let z = ply_scalar(element.get("z"), "z", path)?;
            mesh.vertices.push(Vertex::from_coords(x, y, z));
        }
    }

    if let Some(faces) = ply.payload.get("face") {
        for element in faces {
            let list = element
                .get("vertex_indices")
                .or_else(|| element.get("vertex_index"));
            let indices: Vec<u32> = match list {
                Some(Property::ListInt(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUInt(v)) => v.clone(),
                Some(Property::ListShort(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUShort(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUChar(v)) => v.iter().map(|&i| i as u32).collect(),
                _ => {
                    return Err(MeshError::parse_error(
                        path,
                        "face element without an integer vertex index list",
                    ));
                }
            };
            for i in 1..indices.len().saturating_sub(1) {
                mesh.faces.push([indices[0], indices[i], indices[i + 1]]);
            }
        }
    }

    Ok(mesh)
}

fn ply_scalar(prop: Option<&ply_rs::ply::Property>, name: &str, path: &Path) -> MeshResult<f64> {
    use ply_rs::ply::Property;

    match prop {
        Some(Property::Float(v)) => Ok(*v as f64),
        Some(Property::Double(v)) => Ok(*v),
        Some(Property::Int(v)) => Ok(*v as f64),
        Some(Property::UInt(v)) => Ok(*v as f64),
        Some(Property::Short(v)) => Ok(*v as f64),
        Some(Property::UShort(v)) => Ok(*v as f64),
        Some(Property::Char(v)) => Ok(*v as f64),
        Some(Property::UChar(v)) => Ok(*v as f64),
        _ => Err(MeshError::parse_error(
            path,
            format!("missing or non-numeric vertex property `{}`", name),
        )),
    }
}

/// Save mesh to file, auto-detecting format from extension.
///
/// PLY output is ASCII; use [`save_ply_binary`] for the compact encoding.
pub fn save_mesh(mesh: &Mesh, path: &Path) -> MeshResult<()> {
    match MeshFormat::detect(path)? {
        MeshFormat::Stl => save_stl(mesh, path),
        MeshFormat::Obj => save_obj(mesh, path),
        MeshFormat::Ply => save_ply(mesh, path),
    }
}

/// Save mesh to STL file (binary format).
pub fn save_stl(mesh: &Mesh, path: &Path) -> MeshResult<()> {
    let file = File::create(path).map_err(|e| MeshError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);

    let vertex = |i: u32| {
        let p = &mesh.vertices[i as usize].position;
        stl_io::Vertex::new([p.x as f32, p.y as f32, p.z as f32])
    };
    let triangles: Vec<stl_io::Triangle> = mesh
        .triangles()
        .zip(&mesh.faces)
        .map(|(tri, &[a, b, c])| {
            let n = tri.normal().unwrap_or_else(Vector3::zeros);
            stl_io::Triangle {
                normal: stl_io::Normal::new([n.x as f32, n.y as f32, n.z as f32]),
                vertices: [vertex(a), vertex(b), vertex(c)],
            }
        })
        .collect();

    stl_io::write_stl(&mut writer, triangles.iter()).map_err(|e| MeshError::io_write(path, e))?;
    writer.flush().map_err(|e| MeshError::io_write(path, e))?;

    info!(target: "mesh_registration::io", ?path, faces = mesh.face_count(), "Saved STL");
    Ok(())
}

/// Save mesh to OBJ file, with `vn` lines when normals are present.
pub fn save_obj(mesh: &Mesh, path: &Path) -> MeshResult<()> {
    let file = File::create(path).map_err(|e| MeshError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    write_obj(mesh, &mut writer).map_err(|e| MeshError::io_write(path, e))?;

    info!(
        target: "mesh_registration::io",
        ?path,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        "Saved OBJ"
    );
    Ok(())
}

fn write_obj<W: Write>(mesh: &Mesh, w: &mut W) -> std::io::Result<()> {
    writeln!(w, "# mesh-registration output")?;
    writeln!(w, "# Vertices: {}", mesh.vertex_count())?;
    writeln!(w, "# Faces: {}", mesh.face_count())?;

    for v in &mesh.vertices {
        let p = &v.position;
        writeln!(w, "v {:.9} {:.9} {:.9}", p.x, p.y, p.z)?;
    }

    let has_normals = mesh.vertices.iter().any(|v| v.normal.is_some());
    if has_normals {
        for v in &mesh.vertices {
            let n = v.normal.unwrap_or_else(Vector3::zeros);
            writeln!(w, "vn {:.6} {:.6} {:.6}", n.x, n.y, n.z)?;
        }
    }

    for face in &mesh.faces {
        let [a, b, c] = face.map(|i| i + 1);
        if has_normals {
            writeln!(w, "f {a}//{a} {b}//{b} {c}//{c}")?;
        } else {
            writeln!(w, "f {a} {b} {c}")?;
        }
    }
    w.flush()
}

/// Save mesh to ASCII PLY file.
pub fn save_ply(mesh: &Mesh, path: &Path) -> MeshResult<()> {
    write_ply(mesh, path, ply_rs::ply::Encoding::Ascii)
}

/// Save mesh to binary little-endian PLY file.
pub fn save_ply_binary(mesh: &Mesh, path: &Path) -> MeshResult<()> {
    write_ply(mesh, path, ply_rs::ply::Encoding::BinaryLittleEndian)
}

fn write_ply(mesh: &Mesh, path: &Path, encoding: ply_rs::ply::Encoding) -> MeshResult<()> {
    use ply_rs::ply::{
        Addable, DefaultElement, ElementDef, Ply, Property, PropertyDef, PropertyType, ScalarType,
    };
    use ply_rs::writer::Writer;

    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = encoding;

    let has_normals = mesh.vertices.iter().any(|v| v.normal.is_some());
    let scalar_names: &[&str] = if has_normals {
        &["x", "y", "z", "nx", "ny", "nz"]
    } else {
        &["x", "y", "z"]
    };

    let mut vertex_def = ElementDef::new("vertex".to_string());
    for name in scalar_names {
        vertex_def.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    ply.header.elements.add(vertex_def);

    let mut face_def = ElementDef::new("face".to_string());
    face_def.properties.add(PropertyDef::new(
        "vertex_indices".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    ply.header.elements.add(face_def);

    let vertices: Vec<DefaultElement> = mesh
        .vertices
        .iter()
        .map(|v| {
            let n = v.normal.unwrap_or_else(Vector3::zeros);
            let values = [
                v.position.x,
                v.position.y,
                v.position.z,
                n.x,
                n.y,
                n.z,
            ];
            let mut element = DefaultElement::new();
            for (name, value) in scalar_names.iter().zip(values) {
                element.insert(name.to_string(), Property::Double(value));
            }
            element
        })
        .collect();
    ply.payload.insert("vertex".to_string(), vertices);

    let faces: Vec<DefaultElement> = mesh
        .faces
        .iter()
        .map(|f| {
            let mut element = DefaultElement::new();
            element.insert(
                "vertex_indices".to_string(),
                Property::ListInt(f.iter().map(|&i| i as i32).collect()),
            );
            element
        })
        .collect();
    ply.payload.insert("face".to_string(), faces);

    ply.make_consistent().map_err(|e| {
        MeshError::io_write(path, std::io::Error::other(format!("PLY header: {:?}", e)))
    })?;

    let file = File::create(path).map_err(|e| MeshError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    Writer::new()
        .write_ply(&mut writer, &mut ply)
        .map_err(|e| MeshError::io_write(path, e))?;
    writer.flush().map_err(|e| MeshError::io_write(path, e))?;

    info!(
        target: "mesh_registration::io",
        ?path,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        "Saved PLY"
    );
    Ok(())
}

/// Load landmark pairs from a text file.
///
/// Each non-empty line holds a source and a target vertex index separated by
/// whitespace (or a comma). Text after `#` is ignored. Index ranges are not
/// checked here; see [`Landmarks::validate`].
pub fn load_landmarks(path: &Path) -> MeshResult<Landmarks> {
    let file = File::open(path).map_err(|e| MeshError::io_read(path, e))?;
    let reader = BufReader::new(file);

    let mut landmarks = Landmarks::default();
    for (line_idx, line) in reader.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = line.map_err(|e| MeshError::io_read(path, e))?;
        let content = line.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }

        let fields: Vec<&str> = content
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .collect();
        let [src, tar] = fields.as_slice() else {
            return Err(MeshError::parse_error_at(
                path,
                line_no,
                format!("expected two vertex indices, found {}", fields.len()),
            ));
        };

        let parse = |s: &str| {
            s.parse::<usize>().map_err(|_| {
                MeshError::parse_error_at(path, line_no, format!("`{}` is not a vertex index", s))
            })
        };
        landmarks.source.push(parse(*src)?);
        landmarks.target.push(parse(*tar)?);
    }

    if landmarks.is_empty() {
        warn!(target: "mesh_registration::io", ?path, "Landmark file contains no pairs");
    } else {
        debug!(target: "mesh_registration::io", pairs = landmarks.len(), "Loaded landmarks");
    }
    Ok(landmarks)
}
