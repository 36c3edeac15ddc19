//! Output interfaces the core pushes video and audio into.

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

/// Receives finished frames, one pixel at a time.
pub trait PixelSink: Send {
    /// `rgb` is 0x00RRGGBB.
    fn put_pixel(&mut self, x: usize, y: usize, rgb: u32);

    /// Called once after the last pixel of a frame.
    fn present(&mut self);
}

/// Receives unsigned 8-bit stereo PCM. Blocking or dropping when full is
/// up to the implementation.
pub trait SampleSink: Send {
    fn consume(&mut self, left: &[u8], right: &[u8]);
}

/// Keeps the most recently presented frame.
#[derive(Debug, Clone)]
pub struct FrameCapture {
    pending: Vec<u32>,
    pub frame: Vec<u32>,
    pub frames_presented: u64,
}

impl FrameCapture {
    pub fn new() -> Self {
        Self {
            pending: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
            frame: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
            frames_presented: 0,
        }
    }
}

impl Default for FrameCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelSink for FrameCapture {
    fn put_pixel(&mut self, x: usize, y: usize, rgb: u32) {
        if x < SCREEN_WIDTH && y < SCREEN_HEIGHT {
            self.pending[y * SCREEN_WIDTH + x] = rgb;
        }
    }

    fn present(&mut self) {
        self.frame.copy_from_slice(&self.pending);
        self.frames_presented += 1;
    }
}

/// Appends every sample it is handed.
#[derive(Debug, Clone, Default)]
pub struct SampleCapture {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

impl SampleSink for SampleCapture {
    fn consume(&mut self, left: &[u8], right: &[u8]) {
        self.left.extend_from_slice(left);
        self.right.extend_from_slice(right);
    }
}
