//! The capture → shift → display loop.
//!
//! Each iteration reads one frame, shifts its samples, renders it and polls
//! the keyboard. A failed read skips the render but still polls, so the quit
//! key works even when the camera stops delivering frames.

use crate::capture::{CaptureBackend, CaptureError};
use crate::output::{DisplayError, DisplaySurface};
use crate::transform::{self, DEFAULT_SHIFT};
use crate::utils::RateMeter;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Key that stops the loop.
pub const QUIT_KEY: char = 'q';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error("{count} consecutive frame reads failed, last: {last}")]
    TooManyFailures { count: u32, last: CaptureError },
}

/// Tunables for the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    /// Left shift applied to every sample
    pub shift: u32,
    /// How long each keyboard poll waits
    pub key_wait: Duration,
    /// Give up after this many failed reads in a row; retry forever when unset
    pub max_consecutive_failures: Option<u32>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            shift: DEFAULT_SHIFT,
            key_wait: Duration::from_millis(1),
            max_consecutive_failures: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub frames_rendered: u64,
    pub failed_reads: u64,
    /// Frames the driver numbered but never delivered
    pub skipped_frames: u64,
}

/// Owns the camera and the display for the lifetime of the loop.
pub struct CaptureLoop<C, D> {
    capture: C,
    display: D,
    options: LoopOptions,
    state: LoopState,
    stats: LoopStats,
    consecutive_failures: u32,
    last_sequence: Option<u64>,
    meter: RateMeter,
}

impl<C: CaptureBackend, D: DisplaySurface> CaptureLoop<C, D> {
    pub fn new(capture: C, display: D, options: LoopOptions) -> Self {
        Self {
            capture,
            display,
            options,
            state: LoopState::Running,
            stats: LoopStats::default(),
            consecutive_failures: 0,
            last_sequence: None,
            meter: RateMeter::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Runs one iteration. Does nothing once stopped.
    pub fn step(&mut self) -> Result<LoopState, LoopError> {
        if self.state == LoopState::Stopped {
            return Ok(self.state);
        }
        self.stats.iterations += 1;

        match self.capture.read_frame() {
            Ok(frame) => {
                self.consecutive_failures = 0;
                self.track_sequence(frame.sequence);
                let frame = transform::shift_frame(frame, self.options.shift);
                self.display.show(&frame)?;
                self.stats.frames_rendered += 1;
                self.meter.record_frame();
            }
            Err(e) => {
                self.stats.failed_reads += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.meter.record_failure();
                if self.consecutive_failures == 1 {
                    warn!("Frame read failed, retrying: {}", e);
                } else {
                    debug!("Frame read failed ({} in a row): {}", self.consecutive_failures, e);
                }
                if let Some(max) = self.options.max_consecutive_failures {
                    if self.consecutive_failures >= max {
                        return Err(LoopError::TooManyFailures {
                            count: self.consecutive_failures,
                            last: e,
                        });
                    }
                }
            }
        }

        if let Some(report) = self.meter.poll() {
            debug!(
                "[Perf] {:.2} FPS, {} failed reads (frame {}x{})",
                report.fps,
                report.failed_reads,
                self.capture.frame_size().0,
                self.capture.frame_size().1
            );
        }

        if self.display.poll_key(self.options.key_wait)? == Some(QUIT_KEY) {
            info!("Quit key pressed");
            self.state = LoopState::Stopped;
        }

        Ok(self.state)
    }

    /// Counts frames the driver skipped between two delivered ones.
    fn track_sequence(&mut self, sequence: u64) {
        if let Some(last) = self.last_sequence {
            let skipped = sequence.saturating_sub(last.saturating_add(1));
            if skipped > 0 {
                debug!("Driver skipped {} frame(s) before sequence {}", skipped, sequence);
                self.stats.skipped_frames += skipped;
            }
        }
        self.last_sequence = Some(sequence);
    }

    /// Runs until the quit key is pressed.
    pub fn run(&mut self) -> Result<LoopStats, LoopError> {
        while self.step()? == LoopState::Running {}
        info!(
            "Stopped after {} iterations ({} frames shown, {} failed reads, {} skipped by driver)",
            self.stats.iterations,
            self.stats.frames_rendered,
            self.stats.failed_reads,
            self.stats.skipped_frames
        );
        Ok(self.stats)
    }

    /// Gives back the camera and display.
    pub fn into_parts(self) -> (C, D) {
        (self.capture, self.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RawFrame, SampleFormat, Samples};
    use std::collections::VecDeque;

    /// Plays back a fixed list of read results, then fails every read.
    struct ScriptedCamera {
        reads: VecDeque<Result<RawFrame, CaptureError>>,
    }

    impl ScriptedCamera {
        fn new(reads: Vec<Result<RawFrame, CaptureError>>) -> Self {
            Self {
                reads: reads.into(),
            }
        }
    }

    impl CaptureBackend for ScriptedCamera {
        fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
            self.reads
                .pop_front()
                .unwrap_or_else(|| Err(CaptureError::Read("end of stream".into())))
        }

        fn set_rgb_conversion(&mut self, _enabled: bool) -> Result<(), CaptureError> {
            Ok(())
        }

        fn rgb_conversion(&self) -> bool {
            false
        }

        fn frame_size(&self) -> (u32, u32) {
            (2, 2)
        }
    }

    /// Records every rendered frame and answers polls from a key script.
    #[derive(Default)]
    struct RecordingDisplay {
        rendered: Vec<RawFrame>,
        keys: VecDeque<Option<char>>,
        polls: usize,
    }

    impl RecordingDisplay {
        fn with_keys(keys: &[Option<char>]) -> Self {
            Self {
                keys: keys.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl DisplaySurface for RecordingDisplay {
        fn show(&mut self, frame: &RawFrame) -> Result<(), DisplayError> {
            self.rendered.push(frame.clone());
            Ok(())
        }

        fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>, DisplayError> {
            assert_eq!(timeout, Duration::from_millis(1));
            self.polls += 1;
            Ok(self.keys.pop_front().flatten())
        }
    }

    fn gray(values: &[u8]) -> Result<RawFrame, CaptureError> {
        Ok(RawFrame::from_bytes(2, 2, SampleFormat::Gray8, values.to_vec())?)
    }

    fn read_error() -> Result<RawFrame, CaptureError> {
        Err(CaptureError::Read("device unplugged".into()))
    }

    #[test]
    fn test_zero_frames_until_quit() {
        let camera = ScriptedCamera::new(vec![gray(&[0; 4]), gray(&[0; 4]), gray(&[0; 4])]);
        let display = RecordingDisplay::with_keys(&[None, None, Some('q')]);
        let mut viewer = CaptureLoop::new(camera, display, LoopOptions::default());

        let stats = viewer.run().unwrap();

        assert_eq!(viewer.state(), LoopState::Stopped);
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.failed_reads, 0);
        let (_, display) = viewer.into_parts();
        assert_eq!(display.polls, 3);
        assert_eq!(display.rendered.len(), 3);
        for frame in &display.rendered {
            assert_eq!(frame.samples, Samples::U8(vec![0; 4]));
        }
    }

    #[test]
    fn test_rendered_samples_are_shifted() {
        let camera = ScriptedCamera::new(vec![gray(&[3, 4, 1, 255])]);
        let display = RecordingDisplay::with_keys(&[Some('q')]);
        let mut viewer = CaptureLoop::new(camera, display, LoopOptions::default());

        viewer.run().unwrap();

        let (_, display) = viewer.into_parts();
        assert_eq!(display.rendered[0].samples, Samples::U8(vec![192, 0, 64, 192]));
    }

    #[test]
    fn test_other_keys_keep_running() {
        let frames = (0..200).map(|_| gray(&[1; 4])).collect();
        let keys: Vec<Option<char>> = "abQ x"
            .chars()
            .map(Some)
            .chain(std::iter::repeat(None))
            .take(200)
            .collect();
        let display = RecordingDisplay::with_keys(&keys);
        let mut viewer = CaptureLoop::new(ScriptedCamera::new(frames), display, LoopOptions::default());

        for _ in 0..200 {
            assert_eq!(viewer.step().unwrap(), LoopState::Running);
        }
        assert_eq!(viewer.stats().frames_rendered, 200);
    }

    #[test]
    fn test_stops_on_first_quit_key() {
        let frames = (0..10).map(|_| gray(&[1; 4])).collect();
        let display = RecordingDisplay::with_keys(&[Some('Q'), None, Some('q'), Some('q')]);
        let mut viewer = CaptureLoop::new(ScriptedCamera::new(frames), display, LoopOptions::default());

        let stats = viewer.run().unwrap();
        assert_eq!(stats.iterations, 3);

        // Further steps are no-ops.
        assert_eq!(viewer.step().unwrap(), LoopState::Stopped);
        assert_eq!(viewer.stats().iterations, 3);
    }

    #[test]
    fn test_failed_read_skips_render_but_polls() {
        let camera = ScriptedCamera::new(vec![gray(&[1; 4]), read_error(), gray(&[2; 4])]);
        let display = RecordingDisplay::with_keys(&[None, None, Some('q')]);
        let mut viewer = CaptureLoop::new(camera, display, LoopOptions::default());

        let stats = viewer.run().unwrap();

        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.failed_reads, 1);
        assert_eq!(stats.frames_rendered, 2);
        let (_, display) = viewer.into_parts();
        assert_eq!(display.polls, 3);
        // The failed iteration does not re-show the previous frame.
        assert_eq!(display.rendered[0].samples, Samples::U8(vec![64; 4]));
        assert_eq!(display.rendered[1].samples, Samples::U8(vec![128; 4]));
    }

    #[test]
    fn test_quit_works_while_reads_fail() {
        let display = RecordingDisplay::with_keys(&[None, Some('q')]);
        let mut viewer = CaptureLoop::new(ScriptedCamera::new(vec![]), display, LoopOptions::default());

        let stats = viewer.run().unwrap();
        assert_eq!(stats.failed_reads, 2);
        assert_eq!(stats.frames_rendered, 0);
    }

    #[test]
    fn test_frames_do_not_leak_between_iterations() {
        let camera = ScriptedCamera::new(vec![gray(&[1, 2, 3, 0]), gray(&[0, 0, 0, 1])]);
        let display = RecordingDisplay::with_keys(&[None, Some('q')]);
        let mut viewer = CaptureLoop::new(camera, display, LoopOptions::default());

        viewer.run().unwrap();

        let (_, display) = viewer.into_parts();
        assert_eq!(display.rendered[1].samples, Samples::U8(vec![0, 0, 0, 64]));
    }

    #[test]
    fn test_gives_up_after_consecutive_failures() {
        let camera = ScriptedCamera::new(vec![read_error(), gray(&[1; 4]), read_error(), read_error()]);
        let options = LoopOptions {
            max_consecutive_failures: Some(2),
            ..Default::default()
        };
        let mut viewer = CaptureLoop::new(camera, RecordingDisplay::default(), options);

        let err = viewer.run().unwrap_err();
        assert!(matches!(err, LoopError::TooManyFailures { count: 2, .. }));
        assert_eq!(viewer.stats().iterations, 4);
        assert_eq!(viewer.stats().frames_rendered, 1);
    }

    #[test]
    fn test_failure_count_saturates() {
        let display = RecordingDisplay::with_keys(&[None, None, Some('q')]);
        let mut viewer = CaptureLoop::new(ScriptedCamera::new(vec![]), display, LoopOptions::default());
        viewer.consecutive_failures = u32::MAX - 1;

        let stats = viewer.run().unwrap();

        assert_eq!(stats.failed_reads, 3);
        assert_eq!(viewer.consecutive_failures, u32::MAX);
    }

    #[test]
    fn test_timed_out_reads_still_poll_quit_key() {
        // A triggered sensor that never fires: every read times out.
        let reads = (0..50)
            .map(|_| Err(CaptureError::Read("no frame within 100 ms".into())))
            .collect();
        let keys: Vec<Option<char>> = std::iter::repeat(None).take(49).chain([Some('q')]).collect();
        let display = RecordingDisplay::with_keys(&keys);
        let mut viewer = CaptureLoop::new(ScriptedCamera::new(reads), display, LoopOptions::default());

        let stats = viewer.run().unwrap();

        assert_eq!(viewer.state(), LoopState::Stopped);
        assert_eq!(stats.iterations, 50);
        assert_eq!(stats.failed_reads, 50);
        let (_, display) = viewer.into_parts();
        assert_eq!(display.polls, 50);
        assert!(display.rendered.is_empty());
    }

    #[test]
    fn test_counts_skipped_driver_sequences() {
        let sequenced = |seq: u64| gray(&[0; 4]).map(|f| f.with_sequence(seq));
        let camera = ScriptedCamera::new(vec![
            sequenced(7),
            sequenced(8),
            read_error(),
            sequenced(12),
            sequenced(13),
        ]);
        let display = RecordingDisplay::with_keys(&[None, None, None, None, Some('q')]);
        let mut viewer = CaptureLoop::new(camera, display, LoopOptions::default());

        let stats = viewer.run().unwrap();

        // 9, 10 and 11 never arrived; the first frame sets the baseline.
        assert_eq!(stats.skipped_frames, 3);
        assert_eq!(stats.frames_rendered, 4);
    }

    #[test]
    fn test_wide_frames_shift_at_sixteen_bits() {
        let frame = RawFrame::from_wide(2, 1, SampleFormat::Gray10, vec![1023, 1024]).unwrap();
        let camera = ScriptedCamera::new(vec![Ok(frame)]);
        let display = RecordingDisplay::with_keys(&[Some('q')]);
        let mut viewer = CaptureLoop::new(camera, display, LoopOptions::default());

        viewer.run().unwrap();

        let (_, display) = viewer.into_parts();
        assert_eq!(display.rendered[0].samples, Samples::U16(vec![0xFFC0, 0]));
    }
}
