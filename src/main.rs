use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use image::RgbaImage;
use slime::backend::{ComputeBackend, CpuBackend};
use slime::gpu::{FrameTarget, WgpuBackend};
use slime::time::Clock;
use slime::window::seeded;
use slime::{Config, Engine};

/// Physarum slime mold simulation.
///
/// Viewer keys: Space pause, R restart, Escape quit.
#[derive(Parser, Debug)]
#[command(name = "slime", version, about)]
struct Args {
    /// JSON config file; missing fields use defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seed for agent placement (default: wall clock).
    #[arg(long)]
    seed: Option<u32>,

    /// Run FRAMES updates without a window and save the final frame.
    #[arg(long, value_name = "FRAMES")]
    headless: Option<u32>,

    /// Where --headless writes the final frame.
    #[arg(long, value_name = "FILE", default_value = "slime.png", requires = "headless")]
    out: PathBuf,

    /// Use the CPU backend.
    #[arg(long, requires = "headless")]
    cpu: bool,
}

fn simulate<B: ComputeBackend>(
    backend: B,
    config: Config,
    seed: Option<u32>,
    frames: u32,
    mut target: B::Target,
) -> Result<B::Target, Box<dyn std::error::Error>> {
    let mut engine = seeded(Engine::new(backend, config), seed).with_clock(Clock::fixed(1.0 / 60.0));
    engine.init()?;
    log::info!("running {} frames headless (seed {})", frames, engine.seed());
    for _ in 0..frames {
        engine.update()?;
    }
    engine.render(&mut target)?;
    engine.destroy();
    Ok(target)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let Some(frames) = args.headless else {
        return slime::window::run(config, args.seed);
    };

    let out = args.out;
    let image = if args.cpu {
        simulate(CpuBackend::new()?, config, args.seed, frames, RgbaImage::new(1, 1))?
    } else {
        let target = FrameTarget::Image(RgbaImage::new(1, 1));
        match simulate(WgpuBackend::headless()?, config, args.seed, frames, target)? {
            FrameTarget::Image(image) => image,
            FrameTarget::Surface => return Err("headless run produced no image".into()),
        }
    };
    image.save(&out)?;
    log::info!("wrote {}", out.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
