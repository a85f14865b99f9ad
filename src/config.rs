//! Viewer configuration: built-in defaults, an optional YAML file, then
//! command-line overrides.

use crate::capture::{BackendKind, CaptureConfig, SensorControls};
use crate::transform::DEFAULT_SHIFT;
use crate::viewer::LoopOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the viewer can be told. Defaults match the plain
/// "open camera 0, raw frames, shift by 6, quit on q" behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewerConfig {
    pub device: u32,
    pub backend: BackendKind,
    pub convert_rgb: bool,
    pub shift: u32,
    pub window_name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub key_wait_ms: u64,
    pub max_consecutive_failures: Option<u32>,
    /// Give up on a single read after this long; block indefinitely when unset
    pub read_timeout_ms: Option<u64>,
    pub controls: SensorControls,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            device: 0,
            backend: BackendKind::default(),
            convert_rgb: false,
            shift: DEFAULT_SHIFT,
            window_name: "rawview".to_string(),
            width: None,
            height: None,
            fps: None,
            key_wait_ms: 1,
            max_consecutive_failures: None,
            read_timeout_ms: None,
            controls: SensorControls::default(),
        }
    }
}

impl ViewerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&content)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Parses YAML. Missing keys keep their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width.is_some() != self.height.is_some() {
            return Err(ConfigError::Invalid(
                "width and height must be given together".to_string(),
            ));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(ConfigError::Invalid("frame size must be non-zero".to_string()));
        }
        if self.fps == Some(0) {
            return Err(ConfigError::Invalid("fps must be non-zero".to_string()));
        }
        if self.key_wait_ms == 0 {
            return Err(ConfigError::Invalid(
                "key_wait_ms must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_failures == Some(0) {
            return Err(ConfigError::Invalid(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if let Some(ms) = self.read_timeout_ms {
            // V4L2 polls with a signed 32-bit millisecond timeout.
            if ms == 0 || ms > i32::MAX as u64 {
                return Err(ConfigError::Invalid(format!(
                    "read_timeout_ms must be between 1 and {}",
                    i32::MAX
                )));
            }
        }
        for (name, value) in self.controls.integer_values() {
            if value < 0 {
                return Err(ConfigError::Invalid(format!("{name} must not be negative")));
            }
        }
        if self.window_name.trim().is_empty() {
            return Err(ConfigError::Invalid("window_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_index: self.device,
            disable_rgb_conversion: !self.convert_rgb,
            resolution: self.width.zip(self.height),
            fps: self.fps,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            controls: self.controls,
        }
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            shift: self.shift,
            key_wait: Duration::from_millis(self.key_wait_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

/// Command-line flags that override the config file.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Camera device index
    #[arg(short, long)]
    pub device: Option<u32>,

    /// Capture backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Keep RGB conversion on instead of showing native samples
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub convert_rgb: Option<bool>,

    /// Left shift applied to every sample
    #[arg(short, long)]
    pub shift: Option<u32>,

    /// Title of the display window
    #[arg(long)]
    pub window_name: Option<String>,

    /// Requested frame width
    #[arg(long)]
    pub width: Option<u32>,

    /// Requested frame height
    #[arg(long)]
    pub height: Option<u32>,

    /// Requested frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Milliseconds each keyboard poll waits
    #[arg(long)]
    pub key_wait_ms: Option<u64>,

    /// Exit after this many failed reads in a row
    #[arg(long)]
    pub max_consecutive_failures: Option<u32>,

    /// Fail a frame read after this many milliseconds (v4l backend; use with
    /// externally triggered sensors)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Sensor exposure in driver units (v4l backend)
    #[arg(long)]
    pub exposure: Option<i64>,

    /// Sensor gain (v4l backend)
    #[arg(long)]
    pub gain: Option<i64>,

    /// Sensor analogue gain (v4l backend)
    #[arg(long)]
    pub analogue_gain: Option<i64>,

    /// Vertical blanking in lines (v4l backend)
    #[arg(long)]
    pub vblank: Option<i64>,

    /// Mirror the image horizontally (v4l backend)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub hflip: Option<bool>,

    /// Flip the image vertically (v4l backend)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub vflip: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ViewerConfig) {
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(convert) = self.convert_rgb {
            config.convert_rgb = convert;
        }
        if let Some(shift) = self.shift {
            config.shift = shift;
        }
        if let Some(name) = &self.window_name {
            config.window_name = name.clone();
        }
        if self.width.is_some() {
            config.width = self.width;
        }
        if self.height.is_some() {
            config.height = self.height;
        }
        if self.fps.is_some() {
            config.fps = self.fps;
        }
        if let Some(ms) = self.key_wait_ms {
            config.key_wait_ms = ms;
        }
        if self.max_consecutive_failures.is_some() {
            config.max_consecutive_failures = self.max_consecutive_failures;
        }
        if self.read_timeout_ms.is_some() {
            config.read_timeout_ms = self.read_timeout_ms;
        }

        let controls = &mut config.controls;
        controls.exposure = self.exposure.or(controls.exposure);
        controls.gain = self.gain.or(controls.gain);
        controls.analogue_gain = self.analogue_gain.or(controls.analogue_gain);
        controls.vblank = self.vblank.or(controls.vblank);
        controls.hflip = self.hflip.or(controls.hflip);
        controls.vflip = self.vflip.or(controls.vflip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_rgb_conversion() {
        let config = ViewerConfig::default();
        assert!(config.validate().is_ok());
        let capture = config.capture_config();
        assert_eq!(capture.device_index, 0);
        assert!(capture.disable_rgb_conversion);
        assert_eq!(capture.resolution, None);

        let options = config.loop_options();
        assert_eq!(options.shift, 6);
        assert_eq!(options.key_wait, Duration::from_millis(1));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(ViewerConfig::from_yaml_str("").unwrap(), ViewerConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ViewerConfig::from_yaml_str("backend: v4l\nshift: 4\nwidth: 640\nheight: 480\n").unwrap();
        assert_eq!(config.backend, BackendKind::V4l);
        assert_eq!(config.shift, 4);
        assert_eq!(config.device, 0);
        assert_eq!(config.capture_config().resolution, Some((640, 480)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            ViewerConfig::from_yaml_str("shfit: 4\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_overrides_beat_file() {
        let mut config = ViewerConfig::from_yaml_str("device: 2\nshift: 4\n").unwrap();
        let overrides = ConfigOverrides {
            shift: Some(2),
            convert_rgb: Some(true),
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.device, 2);
        assert_eq!(config.shift, 2);
        assert!(!config.capture_config().disable_rgb_conversion);
    }

    #[test]
    fn test_flag_turns_conversion_off() {
        let mut config = ViewerConfig::from_yaml_str("convert_rgb: true\n").unwrap();
        let overrides = ConfigOverrides {
            convert_rgb: Some(false),
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert!(config.capture_config().disable_rgb_conversion);
    }

    #[derive(clap::Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        overrides: ConfigOverrides,
    }

    fn parse_flags(args: &[&str]) -> ConfigOverrides {
        use clap::Parser;
        TestCli::try_parse_from(std::iter::once("rawview").chain(args.iter().copied()))
            .unwrap()
            .overrides
    }

    #[test]
    fn test_boolean_flags_parse() {
        assert_eq!(parse_flags(&["--convert-rgb"]).convert_rgb, Some(true));
        assert_eq!(parse_flags(&["--convert-rgb=false"]).convert_rgb, Some(false));
        assert_eq!(parse_flags(&[]).convert_rgb, None);
        assert_eq!(parse_flags(&["--vflip"]).vflip, Some(true));
    }

    #[test]
    fn test_width_flag_pairs_with_file_height() {
        let mut config = ViewerConfig::from_yaml_str("width: 320\nheight: 240\n").unwrap();
        parse_flags(&["--width", "640"]).apply(&mut config);
        assert!(config.validate().is_ok());
        assert_eq!(config.capture_config().resolution, Some((640, 240)));
    }

    #[test]
    fn test_sensor_controls_layer() {
        let mut config = ViewerConfig::from_yaml_str(
            "backend: v4l\nread_timeout_ms: 500\ncontrols:\n  exposure: 400\n  hflip: true\n",
        )
        .unwrap();
        parse_flags(&["--gain", "32", "--hflip=false"]).apply(&mut config);
        assert!(config.validate().is_ok());

        let capture = config.capture_config();
        assert_eq!(capture.read_timeout, Some(Duration::from_millis(500)));
        assert_eq!(capture.controls.exposure, Some(400));
        assert_eq!(capture.controls.gain, Some(32));
        assert_eq!(capture.controls.hflip, Some(false));
        assert_eq!(capture.controls.vflip, None);
    }

    #[test]
    fn test_validate_rejects_bad_timeout_and_controls() {
        for ms in [0, i32::MAX as u64 + 1] {
            let config = ViewerConfig {
                read_timeout_ms: Some(ms),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "read_timeout_ms {ms}");
        }

        let mut negative = ViewerConfig::default();
        negative.controls.exposure = Some(-1);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let half_size = ViewerConfig {
            width: Some(640),
            ..Default::default()
        };
        assert!(half_size.validate().is_err());

        let no_wait = ViewerConfig {
            key_wait_ms: 0,
            ..Default::default()
        };
        assert!(no_wait.validate().is_err());

        let zero_failures = ViewerConfig {
            max_consecutive_failures: Some(0),
            ..Default::default()
        };
        assert!(zero_failures.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ViewerConfig::load(Path::new("/nonexistent/rawview.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
