// =============================================================================
// CONFIGURATION - engine settings from config.toml
// =============================================================================
//
// Every table is optional and falls back to the built-in defaults. A loaded
// file is validated before it is turned into the FrameConfig, ResolverConfig
// and DeviceSettings the engine layers take.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backend::host::CompletionMode;
use crate::backend::TextureFormat;
use crate::device::DeviceSettings;
use crate::frame::FrameConfig;
use crate::resolver::ResolverConfig;

/// Contents of config.toml
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub presentation: PresentationConfig,
    pub streaming: StreamingConfig,
    pub caches: CacheConfig,
    pub debug: DebugConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Host,
    Vulkan,
}

/// GPU and frame-pacing settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub back_buffer_count: usize,
    pub ring_buffer_size: u32,
    pub min_alignment: u32,
    pub fence_timeout_ms: u64,
    pub validation_layers: bool,
    pub host_completion: CompletionMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            back_buffer_count: 2,
            ring_buffer_size: 40 * 1024 * 1024,
            min_alignment: 256,
            fence_timeout_ms: 60_000,
            validation_layers: true,
            host_completion: CompletionMode::Deferred,
        }
    }
}

/// Back-buffer settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    pub width: u32,
    pub height: u32,
    /// Packed 0xAARRGGBB, like the legacy Clear call takes it.
    pub clear_color: u32,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            clear_color: 0xFF19_33CC,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub defer_discard: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { defer_discard: true }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub pipeline_cache: bool,
    pub pixel_shader_cache: bool,
    pub sampler_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pipeline_cache: true,
            pixel_shader_cache: true,
            sampler_cache: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// Log frame statistics every N frames (0 = never)
    pub stats_interval: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "legacy_shim.log".to_string(),
            stats_interval: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub frames: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { frames: 240 }
    }
}

impl Config {
    /// `config.toml` from the working directory; defaults if it is missing
    /// or broken.
    pub fn load() -> Self {
        match Self::load_from_path("config.toml") {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring config.toml ({:#}); running with defaults", e);
                Config::default()
            }
        }
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;

        log::info!("Configuration loaded from {}", path.display());
        log::debug!("{:#?}", config);
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let device = &self.device;
        if device.back_buffer_count == 0 || device.back_buffer_count > 8 {
            bail!("back_buffer_count must be 1..=8, got {}", device.back_buffer_count);
        }
        if !device.min_alignment.is_power_of_two() || device.min_alignment < 4 {
            bail!("min_alignment must be a power of two >= 4, got {}", device.min_alignment);
        }
        if device.ring_buffer_size < device.min_alignment {
            bail!(
                "ring_buffer_size ({}) is smaller than min_alignment ({})",
                device.ring_buffer_size,
                device.min_alignment
            );
        }
        if device.fence_timeout_ms == 0 {
            bail!("fence_timeout_ms must be positive");
        }
        if self.presentation.width == 0 || self.presentation.height == 0 {
            bail!(
                "presentation size {}x{} is empty",
                self.presentation.width,
                self.presentation.height
            );
        }
        if self.debug.log_level.parse::<log::LevelFilter>().is_err() {
            bail!("unknown log level '{}'", self.debug.log_level);
        }
        Ok(())
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            back_buffer_count: self.device.back_buffer_count,
            ring_buffer_size: self.device.ring_buffer_size,
            min_alignment: self.device.min_alignment,
            fence_timeout: Duration::from_millis(self.device.fence_timeout_ms),
            width: self.presentation.width,
            height: self.presentation.height,
            format: TextureFormat::Bgra8Unorm,
        }
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            frame: self.frame_config(),
            resolver: ResolverConfig {
                pipeline_cache: self.caches.pipeline_cache,
                pixel_shader_cache: self.caches.pixel_shader_cache,
                sampler_cache: self.caches.sampler_cache,
                defer_discard: self.streaming.defer_discard,
                depth_format: None,
            },
        }
    }

    /// Log level filter, `Info` if the string does not parse
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.device.backend, BackendKind::Host);
        assert_eq!(config.device.ring_buffer_size, 41_943_040);
        assert!(config.streaming.defer_discard);
        assert_eq!(config.demo.frames, 240);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
            [device]
            back_buffer_count = 3
            host_completion = "immediate"

            [streaming]
            defer_discard = false
            "#,
        );
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.device.back_buffer_count, 3);
        assert_eq!(config.device.host_completion, CompletionMode::Immediate);
        assert!(!config.streaming.defer_discard);
        assert_eq!(config.presentation.width, 1280);

        let settings = config.device_settings();
        assert_eq!(settings.frame.back_buffer_count, 3);
        assert!(!settings.resolver.defer_discard);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.device.back_buffer_count, 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = write_config("[device]\nmin_alignment = 100\n");
        let err = Config::load_from_path(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("min_alignment"));

        let file = write_config("[device]\nbackend = \"metal\"\n");
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn fence_timeout_converts_to_duration() {
        let file = write_config("[device]\nfence_timeout_ms = 250\n");
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.frame_config().fence_timeout, Duration::from_millis(250));
    }
}
