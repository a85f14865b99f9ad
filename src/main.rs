//! rawview: show raw camera samples in a window.

use anyhow::{Context, Result};
use clap::Parser;
use rawview::capture;
use rawview::config::{ConfigOverrides, ViewerConfig};
use rawview::output::WindowDisplay;
use rawview::viewer::{CaptureLoop, QUIT_KEY};
use std::path::PathBuf;
use tracing::info;

/// Raw camera sample viewer.
#[derive(Parser, Debug)]
#[command(name = "rawview")]
#[command(about = "Show native camera samples, bit-shifted into the visible range")]
struct Args {
    /// YAML file with viewer settings (flags take precedence)
    #[arg(long)]
    config: Option<PathBuf>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ViewerConfig::load(path)?,
        None => ViewerConfig::default(),
    };
    args.overrides.apply(&mut config);
    config.validate()?;

    if args.list_devices {
        println!("Available cameras ({:?} backend):", config.backend);
        match capture::list_devices(config.backend) {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => {
                eprintln!("Failed to list devices: {}", e);
            }
        }
        return Ok(());
    }

    info!("Opening camera device {} ({:?} backend)...", config.device, config.backend);
    let camera = capture::open(config.backend, &config.capture_config())
        .with_context(|| format!("failed to open camera {}", config.device))?;
    let (width, height) = camera.frame_size();
    info!(
        "Camera ready at {}x{}, RGB conversion {}",
        width,
        height,
        if camera.rgb_conversion() { "on" } else { "off" }
    );

    let display = WindowDisplay::new(config.window_name.clone())?;

    info!("Shifting samples left by {}; press '{}' in the window to quit", config.shift, QUIT_KEY);
    let mut viewer = CaptureLoop::new(camera, display, config.loop_options());
    viewer.run()?;

    // Camera stream stops and the window closes here.
    drop(viewer);
    Ok(())
}
