//! Error types for registration runs with rich diagnostics.
//!
//! Every error carries:
//! - A machine-readable code (`REG-XXXX`)
//! - A category that decides whether it fails a run
//! - Optional location information (file, vertex, landmark)
//! - A recovery suggestion for the common causes
//!
//! # Error Codes
//!
//! - `REG-1xxx`: Input errors (reading, writing, parsing files)
//! - `REG-2xxx`: Configuration errors (parameters, landmark lists)
//! - `REG-3xxx`: Geometry errors (empty or zero-extent meshes)
//! - `REG-4xxx`: Numerical errors (absorbed by the optimizer, only logged)
//! - `REG-5xxx`: Run control (cancellation, phase ordering)
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_registration::{ErrorCategory, MeshError};
//!
//! let err = MeshError::landmark_mismatch(3, 2);
//! assert_eq!(err.code().as_str(), "REG-2001");
//! assert_eq!(err.category(), ErrorCategory::Configuration);
//! ```

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for mesh and registration operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Input errors (1xxx)
    /// REG-1001: Failed to read file
    IoRead = 1001,
    /// REG-1002: Failed to write file
    IoWrite = 1002,
    /// REG-1003: Failed to parse file contents
    ParseError = 1003,
    /// REG-1004: Unsupported file format
    UnsupportedFormat = 1004,
    /// REG-1005: Face references a vertex that does not exist
    InvalidVertexIndex = 1005,
    /// REG-1006: Vertex has NaN or infinite coordinate
    InvalidCoordinate = 1006,

    // Configuration errors (2xxx)
    /// REG-2001: Landmark lists differ in length
    LandmarkMismatch = 2001,
    /// REG-2002: Landmark index outside its mesh
    LandmarkOutOfBounds = 2002,
    /// REG-2003: Parameter outside its valid range
    InvalidParameter = 2003,
    /// REG-2004: Configuration file could not be loaded or saved
    Config = 2004,

    // Geometry errors (3xxx)
    /// REG-3001: Mesh has no vertices or faces
    EmptyMesh = 3001,
    /// REG-3002: Mesh has zero extent or non-finite size
    DegenerateMesh = 3002,

    // Numerical errors (4xxx)
    /// REG-4001: Linear system could not be factorized
    SingularSystem = 4001,
    /// REG-4002: Singular value decomposition failed
    SvdFailed = 4002,

    // Run control (5xxx)
    /// REG-5001: Run cancelled by the caller
    Cancelled = 5001,
    /// REG-5002: Engine phase called out of order
    InvalidPhase = 5002,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `REG-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoRead => "REG-1001",
            ErrorCode::IoWrite => "REG-1002",
            ErrorCode::ParseError => "REG-1003",
            ErrorCode::UnsupportedFormat => "REG-1004",
            ErrorCode::InvalidVertexIndex => "REG-1005",
            ErrorCode::InvalidCoordinate => "REG-1006",
            ErrorCode::LandmarkMismatch => "REG-2001",
            ErrorCode::LandmarkOutOfBounds => "REG-2002",
            ErrorCode::InvalidParameter => "REG-2003",
            ErrorCode::Config => "REG-2004",
            ErrorCode::EmptyMesh => "REG-3001",
            ErrorCode::DegenerateMesh => "REG-3002",
            ErrorCode::SingularSystem => "REG-4001",
            ErrorCode::SvdFailed => "REG-4002",
            ErrorCode::Cancelled => "REG-5001",
            ErrorCode::InvalidPhase => "REG-5002",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an error relates to the outcome of a registration run.
///
/// Only `Numerical` is recovered inside the optimizer; everything else fails
/// the run before any output is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing, unreadable or corrupt input files.
    Input,
    /// Parameters or landmark lists that cannot be honoured.
    Configuration,
    /// Empty or zero-extent geometry.
    Geometry,
    /// Singular systems and failed decompositions during optimization.
    Numerical,
    /// The caller abandoned the run or drove the engine out of order.
    Control,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Geometry => "geometry",
            ErrorCategory::Numerical => "numerical",
            ErrorCategory::Control => "control",
        };
        f.write_str(name)
    }
}

/// Recovery suggestions for registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Re-export the file from the original software.
    ReexportFile { format: Option<String> },
    /// Use a different file format.
    UseDifferentFormat { suggested: Vec<String> },
    /// Check the input files.
    CheckInput { checks: Vec<String> },
    /// Adjust parameters for the run.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Nothing to do; the optimizer recovers on its own.
    Automatic,
    /// No automatic recovery available.
    None,
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::ReexportFile { format } => {
                if let Some(fmt) = format {
                    write!(
                        f,
                        "Try re-exporting the mesh as {} from the original software",
                        fmt
                    )
                } else {
                    write!(f, "Try re-exporting the mesh from the original software")
                }
            }
            RecoverySuggestion::UseDifferentFormat { suggested } => {
                write!(f, "Try using a different format: {}", suggested.join(", "))
            }
            RecoverySuggestion::CheckInput { checks } => {
                write!(f, "Check the input for: {}", checks.join(", "))
            }
            RecoverySuggestion::AdjustParameters { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Try adjusting: {}", params.join(", "))
            }
            RecoverySuggestion::Automatic => {
                write!(f, "Recovered automatically by damping or skipping the update")
            }
            RecoverySuggestion::None => {
                write!(f, "No automatic recovery available")
            }
        }
    }
}

/// Location information for errors.
#[derive(Debug, Clone)]
pub enum MeshLocation {
    /// Error at a specific vertex.
    Vertex { index: usize },
    /// Error at a specific face.
    Face { index: usize },
    /// Error at a landmark pair.
    Landmark { pair: usize },
    /// Error in a file, optionally at a line.
    File { path: PathBuf, line: Option<usize> },
    /// Error at a deformation graph node.
    Node { index: usize },
}

impl std::fmt::Display for MeshLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshLocation::Vertex { index } => write!(f, "vertex {}", index),
            MeshLocation::Face { index } => write!(f, "face {}", index),
            MeshLocation::Landmark { pair } => write!(f, "landmark pair {}", pair),
            MeshLocation::File { path, line } => match line {
                Some(l) => write!(f, "{}:{}", path.display(), l),
                None => write!(f, "{}", path.display()),
            },
            MeshLocation::Node { index } => write!(f, "graph node {}", index),
        }
    }
}

/// Errors that can occur while loading meshes or registering them.
#[derive(Debug, Error, Diagnostic)]
pub enum MeshError {
    /// Error reading from a file.
    #[error("failed to read {path}")]
    #[diagnostic(
        code(registration::io::read),
        help("Check that the file exists and is readable. Try: ls -la {}", path.display())
    )]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing to a file.
    #[error("failed to write {path}")]
    #[diagnostic(
        code(registration::io::write),
        help("Check that the directory exists and is writable")
    )]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a mesh or landmark file.
    #[error("failed to parse {path}: {details}")]
    #[diagnostic(
        code(registration::parse::error),
        help("The file may be corrupted or in an unsupported variant.")
    )]
    ParseError {
        path: PathBuf,
        line: Option<usize>,
        details: String,
    },

    /// Unsupported file format.
    #[error("unsupported mesh format: {extension:?}")]
    #[diagnostic(
        code(registration::format::unsupported),
        help("Supported formats: OBJ, PLY, STL")
    )]
    UnsupportedFormat { extension: Option<String> },

    /// Face references a vertex that does not exist.
    #[error(
        "invalid vertex index: face {face_index} references vertex {vertex_index}, but mesh only has {vertex_count} vertices"
    )]
    #[diagnostic(
        code(registration::input::vertex_index),
        help("Check the mesh export settings; the face list does not match the vertex list.")
    )]
    InvalidVertexIndex {
        face_index: usize,
        vertex_index: u32,
        vertex_count: usize,
    },

    /// Invalid coordinate value (NaN or Infinity).
    #[error("invalid coordinate at vertex {vertex_index}: {coordinate} is {value}")]
    #[diagnostic(
        code(registration::input::coordinate),
        help("Check for numerical issues in the source data.")
    )]
    InvalidCoordinate {
        vertex_index: usize,
        coordinate: &'static str,
        value: f64,
    },

    /// Source and target landmark lists differ in length.
    #[error("landmark lists differ in length: {source_count} source vs {target_count} target")]
    #[diagnostic(
        code(registration::config::landmark_mismatch),
        help("Every source landmark needs exactly one target landmark.")
    )]
    LandmarkMismatch {
        source_count: usize,
        target_count: usize,
    },

    /// A landmark index lies outside its mesh.
    #[error(
        "landmark pair {pair}: {mesh} index {index} is out of range for a mesh with {vertex_count} vertices"
    )]
    #[diagnostic(
        code(registration::config::landmark_index),
        help("Landmark indices are zero-based vertex indices.")
    )]
    LandmarkOutOfBounds {
        pair: usize,
        mesh: &'static str,
        index: usize,
        vertex_count: usize,
    },

    /// A parameter is outside its valid range.
    #[error("invalid parameter `{name}`: {details}")]
    #[diagnostic(code(registration::config::parameter))]
    InvalidParameter { name: &'static str, details: String },

    /// A configuration file could not be read, parsed or written.
    #[error("configuration error: {details}")]
    #[diagnostic(
        code(registration::config::file),
        help("Run `mesh init-config` to write a complete default configuration.")
    )]
    Config {
        details: String,
        path: Option<PathBuf>,
    },

    /// Mesh has no vertices or faces.
    #[error("mesh is empty: {details}")]
    #[diagnostic(
        code(registration::geometry::empty),
        help("The mesh must have at least one vertex and one face.")
    )]
    EmptyMesh { details: String },

    /// Mesh has zero extent or a non-finite bounding box.
    #[error("degenerate mesh: {details}")]
    #[diagnostic(
        code(registration::geometry::degenerate),
        help("All vertices coincide; registration needs a mesh with spatial extent.")
    )]
    DegenerateMesh { details: String },

    /// A linear system could not be factorized even with damping.
    #[error("singular system in {stage}: {details}")]
    #[diagnostic(code(registration::numerical::singular))]
    SingularSystem {
        stage: &'static str,
        node: Option<usize>,
        details: String,
    },

    /// Singular value decomposition did not produce its factors.
    #[error("singular value decomposition failed in {stage}")]
    #[diagnostic(code(registration::numerical::svd))]
    SvdFailed { stage: &'static str },

    /// The run was cancelled.
    #[error("registration cancelled before {phase}")]
    #[diagnostic(code(registration::control::cancelled))]
    Cancelled { phase: &'static str },

    /// An engine phase was invoked before its prerequisite.
    #[error("phase `{phase}` requires `{requires}` to run first")]
    #[diagnostic(code(registration::control::phase))]
    InvalidPhase {
        phase: &'static str,
        requires: &'static str,
    },
}

impl MeshError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            MeshError::IoRead { .. } => ErrorCode::IoRead,
            MeshError::IoWrite { .. } => ErrorCode::IoWrite,
            MeshError::ParseError { .. } => ErrorCode::ParseError,
            MeshError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            MeshError::InvalidVertexIndex { .. } => ErrorCode::InvalidVertexIndex,
            MeshError::InvalidCoordinate { .. } => ErrorCode::InvalidCoordinate,
            MeshError::LandmarkMismatch { .. } => ErrorCode::LandmarkMismatch,
            MeshError::LandmarkOutOfBounds { .. } => ErrorCode::LandmarkOutOfBounds,
            MeshError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            MeshError::Config { .. } => ErrorCode::Config,
            MeshError::EmptyMesh { .. } => ErrorCode::EmptyMesh,
            MeshError::DegenerateMesh { .. } => ErrorCode::DegenerateMesh,
            MeshError::SingularSystem { .. } => ErrorCode::SingularSystem,
            MeshError::SvdFailed { .. } => ErrorCode::SvdFailed,
            MeshError::Cancelled { .. } => ErrorCode::Cancelled,
            MeshError::InvalidPhase { .. } => ErrorCode::InvalidPhase,
        }
    }

    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self.code() as u32 / 1000 {
            1 => ErrorCategory::Input,
            2 => ErrorCategory::Configuration,
            3 => ErrorCategory::Geometry,
            4 => ErrorCategory::Numerical,
            _ => ErrorCategory::Control,
        }
    }

    /// Whether this error ends a run. Numerical errors are recovered locally.
    pub fn is_fatal(&self) -> bool {
        self.category() != ErrorCategory::Numerical
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            MeshError::IoRead { .. } => RecoverySuggestion::CheckInput {
                checks: vec!["file exists".into(), "file permissions".into()],
            },
            MeshError::IoWrite { .. } => RecoverySuggestion::CheckInput {
                checks: vec!["directory exists".into(), "write permissions".into()],
            },
            MeshError::ParseError { .. } => RecoverySuggestion::ReexportFile {
                format: Some("OBJ or PLY".into()),
            },
            MeshError::UnsupportedFormat { .. } => RecoverySuggestion::UseDifferentFormat {
                suggested: vec!["OBJ".into(), "PLY".into(), "STL".into()],
            },
            MeshError::InvalidVertexIndex { .. } | MeshError::InvalidCoordinate { .. } => {
                RecoverySuggestion::ReexportFile { format: None }
            }
            MeshError::LandmarkMismatch { .. } | MeshError::LandmarkOutOfBounds { .. } => {
                RecoverySuggestion::CheckInput {
                    checks: vec![
                        "one `source target` pair per line".into(),
                        "zero-based vertex indices".into(),
                    ],
                }
            }
            MeshError::InvalidParameter { name, .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![((*name).into(), "use a value in the documented range".into())],
            },
            MeshError::Config { .. } => RecoverySuggestion::CheckInput {
                checks: vec!["TOML syntax".into(), "field names".into()],
            },
            MeshError::EmptyMesh { .. } | MeshError::DegenerateMesh { .. } => {
                RecoverySuggestion::CheckInput {
                    checks: vec!["mesh has geometry".into(), "correct export settings".into()],
                }
            }
            MeshError::SingularSystem { .. } | MeshError::SvdFailed { .. } => {
                RecoverySuggestion::Automatic
            }
            MeshError::Cancelled { .. } | MeshError::InvalidPhase { .. } => {
                RecoverySuggestion::None
            }
        }
    }

    /// Returns location information if available.
    pub fn location(&self) -> Option<MeshLocation> {
        match self {
            MeshError::IoRead { path, .. } | MeshError::IoWrite { path, .. } => {
                Some(MeshLocation::File {
                    path: path.clone(),
                    line: None,
                })
            }
            MeshError::ParseError { path, line, .. } => Some(MeshLocation::File {
                path: path.clone(),
                line: *line,
            }),
            MeshError::Config {
                path: Some(path), ..
            } => Some(MeshLocation::File {
                path: path.clone(),
                line: None,
            }),
            MeshError::InvalidVertexIndex { face_index, .. } => {
                Some(MeshLocation::Face { index: *face_index })
            }
            MeshError::InvalidCoordinate { vertex_index, .. } => Some(MeshLocation::Vertex {
                index: *vertex_index,
            }),
            MeshError::LandmarkOutOfBounds { pair, .. } => {
                Some(MeshLocation::Landmark { pair: *pair })
            }
            MeshError::SingularSystem {
                node: Some(node), ..
            } => Some(MeshLocation::Node { index: *node }),
            _ => None,
        }
    }

    // Constructor helpers for common error patterns

    /// Create an IoRead error.
    pub fn io_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MeshError::IoRead {
            path: path.into(),
            source,
        }
    }

    /// Create an IoWrite error.
    pub fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MeshError::IoWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a ParseError without line information.
    pub fn parse_error(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        MeshError::ParseError {
            path: path.into(),
            line: None,
            details: details.into(),
        }
    }

    /// Create a ParseError pointing at a line (1-based).
    pub fn parse_error_at(path: impl Into<PathBuf>, line: usize, details: impl Into<String>) -> Self {
        MeshError::ParseError {
            path: path.into(),
            line: Some(line),
            details: details.into(),
        }
    }

    /// Create an EmptyMesh error.
    pub fn empty_mesh(details: impl Into<String>) -> Self {
        MeshError::EmptyMesh {
            details: details.into(),
        }
    }

    /// Create a DegenerateMesh error.
    pub fn degenerate_mesh(details: impl Into<String>) -> Self {
        MeshError::DegenerateMesh {
            details: details.into(),
        }
    }

    /// Create a LandmarkMismatch error.
    pub fn landmark_mismatch(source_count: usize, target_count: usize) -> Self {
        MeshError::LandmarkMismatch {
            source_count,
            target_count,
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(name: &'static str, details: impl Into<String>) -> Self {
        MeshError::InvalidParameter {
            name,
            details: details.into(),
        }
    }

    /// Create a Config error.
    pub fn config(details: impl Into<String>, path: Option<PathBuf>) -> Self {
        MeshError::Config {
            details: details.into(),
            path,
        }
    }

    /// Create a SingularSystem error.
    pub fn singular_system(
        stage: &'static str,
        node: Option<usize>,
        details: impl Into<String>,
    ) -> Self {
        MeshError::SingularSystem {
            stage,
            node,
            details: details.into(),
        }
    }
}
