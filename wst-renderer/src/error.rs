// Error types for the render core, one enum per layer, using `thiserror`.

use std::path::PathBuf;

use thiserror::Error;
use wst_buffer_manager::{ResourceId, SourceError};

use crate::resources::{GpuResource, LayerId, NativeBufferId};
use crate::surface::SurfaceId;

/// Failures reported by a graphics device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Texture operation failed: {0}")]
    Texture(String),

    #[error("Image import rejected: {0}")]
    ImageImport(String),

    #[error("Shader compilation failed for {shader_type}: {error_log}")]
    ShaderCompilation {
        shader_type: String,
        error_log: String,
    },

    #[error("Shader program linking failed: {0}")]
    ShaderLink(String),

    #[error("Render call failed: {0}")]
    RenderCall(String),

    #[error("Unknown device handle {0}")]
    UnknownHandle(GpuResource),

    #[error("Operation requires an open frame")]
    NoFrame,
}

/// Failures reported by an overlay plane controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaneError {
    #[error("Plane buffer allocation failed: {0}")]
    Allocation(String),

    #[error("Unknown hardware layer {0}")]
    UnknownLayer(LayerId),

    #[error("Unknown native buffer {0}")]
    UnknownBuffer(NativeBufferId),

    #[error("Hardware error: {0}")]
    Hardware(String),
}

/// Why a recognised buffer could not be turned into displayable content.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("Buffer source error: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Plane(#[from] PlaneError),

    #[error("Invalid buffer layout: {0}")]
    InvalidLayout(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Backend lacks {0}")]
    MissingCapability(&'static str),
}

/// Per-commit failures. All of them are recoverable: the surface keeps its
/// previous content.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommitError {
    #[error("Unknown surface {0}")]
    UnknownSurface(SurfaceId),

    #[error("{0} matches no supported buffer family")]
    Unsupported(ResourceId),

    #[error("Import of {resource} failed: {source}")]
    Import {
        resource: ResourceId,
        #[source]
        source: ImportError,
    },

    #[error("Delegate rejected commit: {0}")]
    Delegate(Box<CommitError>),
}

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

/// Backend construction failures. A backend is either fully initialised or
/// not created at all.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Unknown render backend '{0}'")]
    UnknownBackend(String),

    #[error("Invalid output size {width}x{height}")]
    InvalidOutput { width: u32, height: u32 },

    #[error("Fast-path module '{0}' does not implement delegated scene updates")]
    MissingDelegateHook(String),

    #[error("Fast-path module '{0}' cannot delegate to itself")]
    RecursiveDelegate(String),

    #[error("Graphics device initialisation failed: {0}")]
    Device(#[from] DeviceError),

    #[error("Plane controller initialisation failed: {0}")]
    Plane(#[from] PlaneError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Umbrella error for scene updates and host-facing calls.
#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Plane(#[from] PlaneError),

    #[error("Unknown surface {0}")]
    UnknownSurface(SurfaceId),

    #[error("Backend has been terminated")]
    Terminated,
}

/// Result type alias for scene-level operations.
pub type RendererResult<T> = Result<T, RendererError>;
