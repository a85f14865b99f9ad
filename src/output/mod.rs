//! Display surfaces for rendering frames and reading the keyboard.

pub mod window_output;

pub use window_output::WindowDisplay;

use crate::frame::RawFrame;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("window error: {0}")]
    Window(String),
    #[error("GPU error: {0}")]
    Gpu(String),
    #[error("event loop error: {0}")]
    EventLoop(String),
}

/// A named on-screen surface.
pub trait DisplaySurface {
    /// Replaces the displayed image with `frame`. The first call creates the surface.
    fn show(&mut self, frame: &RawFrame) -> Result<(), DisplayError>;

    /// Waits up to `timeout` for a key press and returns its character.
    ///
    /// Keys pressed while nobody was polling are returned first, one per call.
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>, DisplayError>;
}
