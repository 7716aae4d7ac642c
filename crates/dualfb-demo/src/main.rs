#![forbid(unsafe_code)]

use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use dualfb::{
    Buffering, Compositor, CompositorConfig, DualPanelLayout, Rect, VirtualCanvas,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Renders random damage into a two-panel virtual canvas backed by heap surfaces, then checks
/// that both panels show exactly what the canvas holds.
#[derive(Parser, Debug)]
#[command(name = "dualfb-demo")]
struct Args {
    /// Frames to render
    #[arg(long, default_value_t = 500)]
    frames: u32,

    /// RNG seed for the damage pattern
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Width of each panel in pixels
    #[arg(long, default_value_t = 960)]
    panel_width: u32,

    /// Height of each panel in pixels
    #[arg(long, default_value_t = 720)]
    panel_height: u32,

    /// Transfer worker threads (overrides DUALFB_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Render into one buffer instead of two
    #[arg(long, action = clap::ArgAction::SetTrue)]
    single_buffer: bool,

    /// Seconds to wait for a flush before giving up
    #[arg(long, default_value_t = 5)]
    flush_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = CompositorConfig::from_env().context("reading DUALFB_* configuration")?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.single_buffer {
        config.buffering = Buffering::Single;
    }

    let layout = DualPanelLayout {
        panel_width: args.panel_width,
        panel_height: args.panel_height,
        ..DualPanelLayout::default()
    };
    let mut provider = layout.heap_provider();
    let compositor = Compositor::open(config, &mut provider, &layout.surface_ids(), layout.format)
        .context("opening compositor")?;

    let timeout = Duration::from_secs(args.flush_timeout_secs);
    let started = Instant::now();
    render(&compositor, &args, timeout)?;
    if !compositor.drain_timeout(timeout) {
        bail!("flushes still outstanding after {timeout:?}");
    }
    let elapsed = started.elapsed();

    verify(&compositor)?;
    tracing::info!(frames = args.frames, elapsed_ms = elapsed.as_millis() as u64, "panels verified");
    println!("{}", compositor.coordinator().stats().to_json());

    compositor.shutdown();
    if provider.live_mappings() != 0 {
        bail!("{} surface mappings leaked", provider.live_mappings());
    }
    Ok(())
}

/// Each frame damages a random rectangle, flushes it, and moves on to the other buffer.
///
/// The next frame is drawn while the previous flush is still running, but its flush is only
/// requested once the previous one has completed, so overlapping damage lands on the panels in
/// frame order.
fn render(compositor: &Compositor, args: &Args, timeout: Duration) -> anyhow::Result<()> {
    let canvas = compositor.canvas();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut previous: Option<(Rect, mpsc::Receiver<()>)> = None;

    for frame in 0..args.frames {
        let region = random_region(&mut rng, canvas);
        let color: [u8; 4] = [rng.gen(), rng.gen(), rng.gen(), 0];
        canvas.fill_rect(canvas.draw_buffer(), region, &color)?;

        if let Some((_, done)) = previous.take() {
            done.recv_timeout(timeout)
                .with_context(|| format!("frame {} never finished flushing", frame - 1))?;
        }

        let (tx, rx) = mpsc::channel();
        compositor.request_flush(region, move || {
            let _ = tx.send(());
        })?;
        previous = Some((region, rx));

        if canvas.buffering() == Buffering::Double {
            let old = canvas.draw_buffer().clone();
            let new_index = compositor.swap_buffers();
            canvas.sync_region(&old, &canvas.buffers()[new_index], region)?;
        }
    }

    if let Some((region, done)) = previous {
        done.recv_timeout(timeout)
            .with_context(|| format!("last flush of {region} never finished"))?;
    }
    Ok(())
}

fn random_region(rng: &mut StdRng, canvas: &VirtualCanvas) -> Rect {
    let (width, height) = (canvas.width() as i32, canvas.height() as i32);
    let w = rng.gen_range(1..=(width / 4).max(1));
    let h = rng.gen_range(1..=(height / 4).max(1));
    let x = rng.gen_range(0..=width - w);
    let y = rng.gen_range(0..=height - h);
    Rect::new(x, y, x + w - 1, y + h - 1)
}

fn verify(compositor: &Compositor) -> anyhow::Result<()> {
    let canvas = compositor.canvas();
    let pixels = canvas.draw_buffer().read();
    let bpp = canvas.bytes_per_pixel() as usize;

    for surface in compositor.surfaces().surfaces() {
        let shown = surface.snapshot()?;
        let row_bytes = surface.width() as usize * bpp;
        for y in 0..surface.height() {
            let start = canvas.byte_offset(surface.origin_x() as i32, y as i32);
            let expected = &pixels[start..start + row_bytes];
            let actual = &shown[y as usize * row_bytes..(y as usize + 1) * row_bytes];
            if expected != actual {
                bail!("{} row {y} differs from the canvas", surface.id());
            }
        }
        tracing::debug!(surface = %surface.id(), "matches canvas");
    }

    Ok(())
}
