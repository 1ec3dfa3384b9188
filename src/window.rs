//! Interactive viewer: a winit window driving an `Engine<WgpuBackend>`.
//!
//! Every redraw calls [`Engine::tick`] once and asks for the next redraw.
//!
//! | Key | Action |
//! |-----|--------|
//! | Space | pause / resume |
//! | R | restart with a new seed |
//! | Escape | quit |

use std::sync::Arc;

use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use crate::agent::hash;
use crate::backend::ComputeBackend;
use crate::config::Config;
use crate::engine::{Engine, TickOutcome};
use crate::error::EngineError;
use crate::gpu::{FrameTarget, WgpuBackend};

const TITLE: &str = "Slime";

/// Open a window and run the simulation until it is closed.
///
/// Without a seed the engine picks one from the wall clock. Returns the
/// error that stopped the engine, if any.
pub fn run(config: Config, seed: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, seed);
    event_loop.run_app(&mut app)?;

    match app.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Apply an explicit seed, or keep the wall-clock seed the engine chose.
pub fn seeded<B: ComputeBackend>(engine: Engine<B>, seed: Option<u32>) -> Engine<B> {
    match seed {
        Some(seed) => engine.with_seed(seed),
        None => engine,
    }
}

struct App {
    config: Config,
    seed: Option<u32>,
    window: Option<Arc<Window>>,
    engine: Option<Engine<WgpuBackend>>,
    target: FrameTarget,
    error: Option<EngineError>,
    last_title_frame: u32,
}

impl App {
    fn new(config: Config, seed: Option<u32>) -> Self {
        Self {
            config,
            seed,
            window: None,
            engine: None,
            target: FrameTarget::Surface,
            error: None,
            last_title_frame: 0,
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<(), EngineError> {
        let (w, h) = self.config.size;
        let attrs = Window::default_attributes()
            .with_title(TITLE)
            .with_inner_size(winit::dpi::LogicalSize::new(w, h));
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .map_err(|e| EngineError::CapabilityUnavailable(e.to_string()))?,
        );
        self.window = Some(window.clone());

        let backend = WgpuBackend::for_window(window)?;
        let mut engine = seeded(Engine::new(backend, self.config.clone()), self.seed);
        engine.init()?;
        self.engine = Some(engine);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: EngineError) {
        log::error!("{}", err);
        self.error = Some(err);
        event_loop.exit();
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, event: KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        let Some(engine) = &mut self.engine else {
            return;
        };
        match code {
            KeyCode::Escape => event_loop.exit(),
            KeyCode::Space => {
                let paused = !engine.is_paused();
                engine.set_paused(paused);
            }
            KeyCode::KeyR => {
                let seed = hash(engine.seed().wrapping_add(1));
                self.seed = Some(seed);
                log::info!("restarting with seed {}", seed);
                if let Err(err) = engine.restart(seed) {
                    self.fail(event_loop, err);
                }
            }
            _ => {}
        }
    }

    fn update_title(&mut self) {
        let (Some(window), Some(engine)) = (&self.window, &self.engine) else {
            return;
        };
        // Refresh a few times a second, not every frame.
        if engine.frame().wrapping_sub(self.last_title_frame) < 30 && !engine.is_paused() {
            return;
        }
        self.last_title_frame = engine.frame();
        let status = if engine.is_paused() { " [paused]" } else { "" };
        window.set_title(&format!(
            "{} - {:.0} fps - frame {}{}",
            TITLE,
            engine.clock().fps(),
            engine.frame(),
            status
        ));
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(err) = self.start(event_loop) {
                self.fail(event_loop, err);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(engine) = &mut self.engine {
                    engine.backend_mut().resize_surface(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.handle_key(event_loop, event),
            WindowEvent::RedrawRequested => {
                let result = match &mut self.engine {
                    Some(engine) => engine.tick(&mut self.target),
                    None => Ok(TickOutcome::Paused),
                };
                if let Err(err) = result {
                    self.fail(event_loop, err);
                    return;
                }
                self.update_title();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn engine() -> Engine<CpuBackend> {
        Engine::new(CpuBackend::with_threads(1).unwrap(), Config::default())
    }

    #[test]
    fn test_explicit_seed_wins() {
        assert_eq!(seeded(engine(), Some(17)).seed(), 17);
    }

    #[test]
    fn test_missing_seed_keeps_engine_choice() {
        let engine = engine();
        let chosen = engine.seed();
        assert_eq!(seeded(engine, None).seed(), chosen);
    }
}
