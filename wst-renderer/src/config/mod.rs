//! Renderer configuration.
//!
//! [`RendererConfig`] is read once, when a backend is constructed:
//!
//! 1. Start from the defaults in [`defaults`].
//! 2. If `WESTEROS_RENDER_CONFIG` names a TOML file, parse it. Unknown keys
//!    are rejected.
//! 3. Apply the `WESTEROS_*` environment variables on top; the environment
//!    always wins.
//!
//! ```toml
//! secure_video = false
//! gl_fps = true
//! overlay_fps = false
//! fast_render = "overlay-colormatrix"
//! overlay_buffers = 3
//! displayed_timeout_ms = 32
//! ```

mod defaults;
pub mod loader;

use std::time::Duration;

use serde::Deserialize;

pub use loader::{CONFIG_PATH_ENV, DISPLAYED_TIMEOUT_ENV, FAST_RENDER_ENV, GL_FPS_ENV, OVERLAY_BUFFERS_ENV, OVERLAY_FPS_ENV, SECURE_VIDEO_ENV};

/// Settings shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendererConfig {
    /// Protected buffer allocation on the colour-matrix overlay path.
    #[serde(default = "defaults::default_false")]
    pub secure_video: bool,

    /// Frame-rate reports from the GPU backend.
    #[serde(default = "defaults::default_false")]
    pub gl_fps: bool,

    /// Frame-rate reports from the overlay backends.
    #[serde(default = "defaults::default_false")]
    pub overlay_fps: bool,

    /// Registry name of the fast-path delegate used by the embedded backend.
    #[serde(default = "defaults::default_fast_render")]
    pub fast_render: Option<String>,

    /// Depth of each overlay surface's native buffer ring.
    #[serde(default = "defaults::default_overlay_buffers")]
    pub overlay_buffers: usize,

    /// Upper bound on waiting for displayed feedback, in milliseconds.
    #[serde(default = "defaults::default_displayed_timeout_ms")]
    pub displayed_timeout_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            secure_video: defaults::default_false(),
            gl_fps: defaults::default_false(),
            overlay_fps: defaults::default_false(),
            fast_render: defaults::default_fast_render(),
            overlay_buffers: defaults::default_overlay_buffers(),
            displayed_timeout_ms: defaults::default_displayed_timeout_ms(),
        }
    }
}

impl RendererConfig {
    pub fn displayed_timeout(&self) -> Duration {
        Duration::from_millis(self.displayed_timeout_ms)
    }
}
