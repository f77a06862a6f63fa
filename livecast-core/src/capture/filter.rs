//! Filter stage: renders captured frames into the encoder surface

use tracing::{debug, warn};

use crate::error::{LivecastError, Result};
use crate::types::{CaptureFrame, Filter, VideoSurface};

/// Renders a captured frame through the active filter into the encoder's
/// input surface
pub trait FilterStage: Send {
    fn set_filter(&mut self, filter: Filter);

    fn filter(&self) -> Filter;

    /// Scale `frame` to the surface size and apply the filter
    fn render(&mut self, frame: &CaptureFrame, surface: &mut VideoSurface) -> Result<()>;

    /// Drop GPU resources; further renders fail
    fn release(&mut self);
}

/// CPU implementation of every [`Filter`]
pub struct SoftwareFilterStage {
    width: u32,
    height: u32,
    filter: Filter,
    released: bool,
}

impl SoftwareFilterStage {
    pub fn new(width: u32, height: u32) -> Self {
        debug!("Creating software filter stage {}x{}", width, height);
        Self {
            width,
            height,
            filter: Filter::None,
            released: false,
        }
    }
}

impl FilterStage for SoftwareFilterStage {
    fn set_filter(&mut self, filter: Filter) {
        if filter != self.filter {
            debug!("Filter {} -> {}", self.filter, filter);
            self.filter = filter;
        }
    }

    fn filter(&self) -> Filter {
        self.filter
    }

    fn render(&mut self, frame: &CaptureFrame, surface: &mut VideoSurface) -> Result<()> {
        if self.released {
            return Err(LivecastError::invalid_state("render", "released"));
        }
        if surface.width != self.width || surface.height != self.height {
            return Err(LivecastError::config(format!(
                "Surface {}x{} does not match filter stage {}x{}",
                surface.width, surface.height, self.width, self.height
            )));
        }
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.data.len() < expected || frame.width == 0 || frame.height == 0 {
            warn!(
                "Frame buffer too small: {} < {} ({}x{})",
                frame.data.len(),
                expected,
                frame.width,
                frame.height
            );
            return Ok(());
        }

        scale_nearest(frame, surface, self.filter == Filter::Mirror);
        match self.filter {
            Filter::BlackWhite => apply_black_white(&mut surface.data),
            Filter::Night => apply_night(&mut surface.data),
            Filter::Invert => apply_invert(&mut surface.data),
            Filter::None | Filter::Mirror => {}
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            debug!("Software filter stage released");
        }
    }
}

/// Nearest-neighbour scale, optionally flipped horizontally
fn scale_nearest(frame: &CaptureFrame, surface: &mut VideoSurface, mirror: bool) {
    let (sw, sh) = (frame.width as usize, frame.height as usize);
    let (dw, dh) = (surface.width as usize, surface.height as usize);

    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let dx = if mirror { dw - 1 - x } else { x };
            let sx = dx * sw / dw;
            let src = (sy * sw + sx) * 4;
            let dst = (y * dw + x) * 4;
            surface.data[dst..dst + 4].copy_from_slice(&frame.data[src..src + 4]);
        }
    }
}

/// BT.601 luma in 8-bit fixed point
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8
}

fn apply_black_white(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        let y = luma(px[0], px[1], px[2]);
        px[0] = y;
        px[1] = y;
        px[2] = y;
    }
}

/// Night vision: boosted luma on the green channel
fn apply_night(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        let y = luma(px[0], px[1], px[2]) as u32;
        px[0] = (y / 4) as u8;
        px[1] = (y * 3 / 2).min(255) as u8;
        px[2] = (y / 4) as u8;
    }
}

fn apply_invert(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        px[0] = 255 - px[0];
        px[1] = 255 - px[1];
        px[2] = 255 - px[2];
    }
}
