//! SDL2 Window Display Module
//! Shows the newest frame from the buffer in a resizable window.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{info, warn};

use super::{RenderSink, RenderTick};
use crate::capture::{convert, CancelToken, Frame, PixelFormat};
use crate::error::RenderError;

/// SDL2 Window Display
/// Frames are scaled to the window; the texture is recreated per frame since
/// the source resolution can change across reconnects.
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, title: &str, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(title, width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
        })
    }

    /// Drive `tick` at `fps` until the window closes or `shutdown` fires
    pub fn run(
        &mut self,
        sdl_context: &sdl2::Sdl,
        tick: &mut RenderTick,
        fps: u32,
        shutdown: &CancelToken,
    ) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let interval = Duration::from_secs(1) / fps.max(1);

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    _ => {}
                }
            }

            if let Err(e) = tick.tick(self) {
                warn!("Failed to render frame: {}", e);
            }

            if shutdown.wait_timeout(interval) {
                break;
            }
        }

        Ok(())
    }
}

impl RenderSink for Sdl2Display {
    fn render(&mut self, frame: &Frame) -> Result<(), RenderError> {
        let rgb = match frame.format() {
            PixelFormat::Rgb24 => frame.clone(),
            PixelFormat::Gray8 => convert::convert(frame, PixelFormat::Rgb24)?,
            other => return Err(RenderError::NotDisplayable(other)),
        };
        let backend = |e: String| RenderError::Backend(e);

        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, rgb.width(), rgb.height())
            .map_err(|e| backend(e.to_string()))?;

        texture
            .update(None, &rgb.data, rgb.meta.stride as usize)
            .map_err(|e| backend(e.to_string()))?;

        self.canvas.clear();
        self.canvas.copy(&texture, None, None).map_err(backend)?;
        self.canvas.present();
        Ok(())
    }
}
