//! Backend construction by name.
//!
//! Compositors pick their renderer by name at startup. The registry maps
//! each name to a factory; the embedded backend resolves its fast-path
//! delegate through the same registry, using the configured module name.

use std::collections::BTreeMap;
use std::fmt;

use tracing::info;
use wst_buffer_manager::{BufferSources, NativeHandle};

use crate::backend::embedded::EmbeddedBackend;
use crate::backend::gpu::GpuBackend;
use crate::backend::overlay::{OverlayBackend, OverlayFlavor};
use crate::backend::planes::VirtualPlanes;
use crate::config::RendererConfig;
use crate::contract::RenderBackend;
use crate::device::soft::SoftDevice;
use crate::error::InitError;

pub const SOFT: &str = "soft";
pub const OVERLAY_COLOR_MATRIX: &str = "overlay-colormatrix";
pub const OVERLAY_ELEMENT: &str = "overlay-element";
pub const EMBEDDED: &str = "embedded";

/// Everything a backend needs at construction.
#[derive(Debug, Clone)]
pub struct BackendInit {
    pub output_width: u32,
    pub output_height: u32,
    /// Display to bind client buffers to, if the platform has one.
    pub display: Option<NativeHandle>,
    pub sources: BufferSources,
    pub config: RendererConfig,
}

impl BackendInit {
    pub fn new(output_width: u32, output_height: u32, sources: BufferSources) -> Self {
        Self {
            output_width,
            output_height,
            display: None,
            sources,
            config: RendererConfig::default(),
        }
    }

    /// Same as [`BackendInit::new`] with the configuration read from the
    /// environment.
    pub fn from_env(output_width: u32, output_height: u32, sources: BufferSources) -> Result<Self, InitError> {
        Ok(Self::new(output_width, output_height, sources).with_config(RendererConfig::load()?))
    }

    pub fn with_config(mut self, config: RendererConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_display(mut self, display: NativeHandle) -> Self {
        self.display = Some(display);
        self
    }

    pub(crate) fn validate_output(&self) -> Result<(), InitError> {
        if self.output_width == 0 || self.output_height == 0 {
            return Err(InitError::InvalidOutput {
                width: self.output_width,
                height: self.output_height,
            });
        }
        Ok(())
    }
}

/// Creates one backend. The registry is passed in so a backend can build
/// its own delegate.
pub type BackendFactory = fn(&BackendInit, &BackendRegistry) -> Result<Box<dyn RenderBackend>, InitError>;

#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The software GPU path, both virtual overlay paths and the embedded
    /// path.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SOFT, create_soft);
        registry.register(OVERLAY_COLOR_MATRIX, create_overlay_color_matrix);
        registry.register(OVERLAY_ELEMENT, create_overlay_element);
        registry.register(EMBEDDED, create_embedded);
        registry
    }

    /// Adds or replaces a factory.
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Creates the backend registered under `name`.
    ///
    /// Factories may call back into the registry, which is how the embedded
    /// backend resolves its fast-path delegate.
    ///
    /// # Arguments
    /// * `name`: Registered backend name, e.g. [`SOFT`] or [`OVERLAY_ELEMENT`].
    /// * `init`: Output size, display, buffer adapters and configuration.
    ///
    /// # Errors
    /// `InitError::UnknownBackend` when nothing is registered under `name`;
    /// otherwise whatever the factory reports. A backend is never returned
    /// half-initialised.
    pub fn create(&self, name: &str, init: &BackendInit) -> Result<Box<dyn RenderBackend>, InitError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| InitError::UnknownBackend(name.to_string()))?;
        info!("Creating render backend '{}'", name);
        factory(init, self)
    }

    /// Builds the software embedded backend with its configured fast-path
    /// delegate.
    pub fn create_embedded(&self, init: &BackendInit) -> Result<EmbeddedBackend<SoftDevice>, InitError> {
        let delegate = match init.config.fast_render.as_deref() {
            None => None,
            Some(EMBEDDED) => return Err(InitError::RecursiveDelegate(EMBEDDED.to_string())),
            Some(name) => {
                let mut delegate_init = init.clone();
                delegate_init.config.fast_render = None;
                Some(self.create(name, &delegate_init)?)
            }
        };
        let device = SoftDevice::new(init.output_width, init.output_height);
        EmbeddedBackend::new(EMBEDDED, device, init, delegate)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

fn create_soft(init: &BackendInit, _: &BackendRegistry) -> Result<Box<dyn RenderBackend>, InitError> {
    let device = SoftDevice::new(init.output_width, init.output_height);
    Ok(Box::new(GpuBackend::new(SOFT, device, init)?))
}

fn create_overlay_color_matrix(init: &BackendInit, _: &BackendRegistry) -> Result<Box<dyn RenderBackend>, InitError> {
    let backend = OverlayBackend::new(OVERLAY_COLOR_MATRIX, OverlayFlavor::ColorMatrix, VirtualPlanes::new(), init)?;
    Ok(Box::new(backend))
}

fn create_overlay_element(init: &BackendInit, _: &BackendRegistry) -> Result<Box<dyn RenderBackend>, InitError> {
    let backend = OverlayBackend::new(OVERLAY_ELEMENT, OverlayFlavor::ElementAlpha, VirtualPlanes::new(), init)?;
    Ok(Box::new(backend))
}

fn create_embedded(init: &BackendInit, registry: &BackendRegistry) -> Result<Box<dyn RenderBackend>, InitError> {
    Ok(Box::new(registry.create_embedded(init)?))
}
