use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use dualfb::{
    AcquireStage, Buffering, Compositor, CompositorConfig, DualFbError, DualPanelLayout,
    GeometryPolicy, HeapSurfaceProvider, InlineEngine, PixelFormat, Rect, SubmitError,
    SurfaceId, TransferEngine, WorkItem,
};
use pretty_assertions::assert_eq;

const RED: [u8; 4] = [0x00, 0x00, 0xff, 0x00];

fn open_default(config: CompositorConfig) -> (Compositor, HeapSurfaceProvider) {
    let layout = DualPanelLayout::default();
    let mut provider = layout.heap_provider();
    let compositor =
        Compositor::open(config, &mut provider, &layout.surface_ids(), layout.format).unwrap();
    (compositor, provider)
}

fn clamping() -> CompositorConfig {
    CompositorConfig {
        geometry_policy: GeometryPolicy::Clamp,
        ..CompositorConfig::default()
    }
}

fn wait_for_flush(compositor: &Compositor, region: Rect) {
    let (tx, rx) = mpsc::channel();
    compositor
        .request_flush(region, move || tx.send(()).unwrap())
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("flush did not complete");
}

/// Every pixel of `surface` is `RED` inside `lit` and zero elsewhere.
fn assert_only_lit(compositor: &Compositor, surface: usize, lit: Option<Rect>) {
    let surface = compositor.surfaces().get(surface).unwrap();
    let pixels = surface.snapshot().unwrap();
    let width = surface.width() as usize;
    for (i, px) in pixels.chunks_exact(4).enumerate() {
        let (x, y) = ((i % width) as i32, (i / width) as i32);
        let inside = lit.map_or(false, |r| r.contains(&Rect::new(x, y, x, y)));
        let expected: &[u8] = if inside { &RED } else { &[0; 4] };
        assert!(px == expected, "{} pixel ({x},{y}) is {px:?}", surface.id());
    }
}

#[test]
fn straddling_region_lands_on_both_panels() {
    let (compositor, _provider) = open_default(CompositorConfig::default());
    let canvas = compositor.canvas();
    let region = Rect::new(900, 10, 1020, 20);

    canvas.fill_rect(canvas.draw_buffer(), region, &RED).unwrap();
    wait_for_flush(&compositor, region);
    compositor.drain();

    assert_only_lit(&compositor, 0, Some(Rect::new(900, 10, 959, 20)));
    assert_only_lit(&compositor, 1, Some(Rect::new(0, 10, 60, 20)));

    let stats = compositor.stats();
    assert_eq!(stats.jobs_submitted + stats.jobs_inline, 2);
    assert_eq!(stats.bytes_copied, 121 * 11 * 4);
}

#[test]
fn region_on_one_panel_leaves_the_other_untouched() {
    let (compositor, _provider) = open_default(CompositorConfig::default());
    let canvas = compositor.canvas();
    let region = Rect::new(1000, 700, 1919, 719);

    canvas.fill_rect(canvas.draw_buffer(), region, &RED).unwrap();
    wait_for_flush(&compositor, region);

    assert_only_lit(&compositor, 0, None);
    assert_only_lit(&compositor, 1, Some(Rect::new(40, 700, 959, 719)));
}

#[test]
fn degenerate_and_outside_regions_complete_immediately() {
    let (compositor, _provider) = open_default(clamping());

    for region in [
        Rect::new(10, 10, 9, 10),
        Rect::new(10, 10, 10, 9),
        Rect::new(1920, 0, 2000, 10),
        Rect::new(0, 720, 100, 800),
        Rect::new(-50, -50, -1, -1),
    ] {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        compositor
            .request_flush(region, move || {
                inner.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{region}");
    }

    let stats = compositor.stats();
    assert_eq!(stats.flushes_immediate, 5);
    assert_eq!(stats.regions_clamped, 3);
    assert_eq!(stats.jobs_submitted + stats.jobs_inline, 0);
}

#[test]
fn partially_outside_region_is_clamped() {
    let (compositor, _provider) = open_default(clamping());
    let canvas = compositor.canvas();
    canvas
        .fill_rect(canvas.draw_buffer(), Rect::new(1900, 700, 1919, 719), &RED)
        .unwrap();

    wait_for_flush(&compositor, Rect::new(1900, 700, 1999, 799));
    assert_only_lit(&compositor, 1, Some(Rect::new(940, 700, 959, 719)));
    assert_eq!(compositor.stats().regions_clamped, 1);
}

#[test]
fn strict_policy_rejects_outside_regions() {
    let config = CompositorConfig {
        geometry_policy: GeometryPolicy::Strict,
        ..CompositorConfig::default()
    };
    let (compositor, _provider) = open_default(config);

    let calls = Arc::new(AtomicUsize::new(0));
    let inner = calls.clone();
    let err = compositor
        .request_flush(Rect::new(1900, 0, 1920, 0), move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert!(matches!(err, DualFbError::GeometryViolation { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn shorter_panel_only_receives_its_rows() {
    let mut provider = HeapSurfaceProvider::new()
        .with_panel("tall", 32, 24, PixelFormat::Rgb565)
        .with_panel("short", 32, 16, PixelFormat::Rgb565);
    let compositor = Compositor::with_engine(
        CompositorConfig::default(),
        &mut provider,
        &["tall".into(), "short".into()],
        PixelFormat::Rgb565,
        Arc::new(InlineEngine),
    )
    .unwrap();
    let canvas = compositor.canvas();
    assert_eq!((canvas.width(), canvas.height()), (64, 24));

    let region = Rect::new(30, 10, 33, 20);
    canvas.fill_rect(canvas.draw_buffer(), region, &[0xab, 0xcd]).unwrap();
    compositor.request_flush(region, || {}).unwrap();

    let tall = compositor.surfaces().get(0).unwrap();
    assert_eq!(tall.read_rect(Rect::new(30, 10, 31, 20)).unwrap(), [0xab, 0xcd].repeat(22));
    let short = compositor.surfaces().get(1).unwrap();
    assert_eq!(short.read_rect(Rect::new(0, 10, 1, 15)).unwrap(), [0xab, 0xcd].repeat(12));
    assert_eq!(compositor.stats().bytes_copied, (2 * 11 + 2 * 6) * 2);
}

#[test]
fn acquisition_failure_releases_everything() {
    for stage in [AcquireStage::Open, AcquireStage::GeometryQuery, AcquireStage::Map] {
        let layout = DualPanelLayout::default();
        let mut provider = layout.heap_provider().fail_at(layout.right.clone(), stage);

        let err = Compositor::open(
            CompositorConfig::default(),
            &mut provider,
            &layout.surface_ids(),
            layout.format,
        )
        .unwrap_err();
        match err {
            DualFbError::ResourceAcquisition(err) => {
                assert_eq!(err.stage(), stage);
                assert_eq!(err.surface(), &SurfaceId::new("/dev/fb1"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(provider.live_mappings(), 0, "{stage:?}");
    }
}

#[test]
fn format_mismatch_fails_open() {
    let layout = DualPanelLayout::default();
    let mut provider = layout.heap_provider();
    let err = Compositor::open(
        CompositorConfig::default(),
        &mut provider,
        &layout.surface_ids(),
        PixelFormat::Rgb565,
    )
    .unwrap_err();
    assert!(matches!(err, DualFbError::FormatMismatch { .. }));
    assert_eq!(provider.live_mappings(), 0);
}

#[test]
fn shutdown_drains_and_releases_surfaces() {
    let (compositor, provider) = open_default(CompositorConfig {
        workers: 2,
        ..CompositorConfig::default()
    });
    assert_eq!(provider.live_mappings(), 2);

    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..50 {
        let done = done.clone();
        compositor
            .request_flush(Rect::new(i * 30, 0, i * 30 + 100, 719), move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    let surfaces = compositor.surfaces().clone();
    compositor.shutdown();

    assert_eq!(done.load(Ordering::SeqCst), 50);
    assert!(surfaces.surfaces().iter().all(|s| !s.is_open()));
    assert_eq!(provider.live_mappings(), 0);
}

#[test]
fn dropping_the_compositor_releases_surfaces() {
    let (compositor, provider) = open_default(CompositorConfig::default());
    wait_for_flush(&compositor, Rect::new(0, 0, 10, 10));
    drop(compositor);
    assert_eq!(provider.live_mappings(), 0);
}

/// Holds work until released.
#[derive(Default)]
struct GatedEngine {
    held: Mutex<Vec<WorkItem>>,
}

impl TransferEngine for GatedEngine {
    fn submit(&self, item: WorkItem) -> Result<(), SubmitError> {
        self.held.lock().unwrap().push(item);
        Ok(())
    }
}

#[test]
fn single_buffer_drawing_waits_for_the_flush() {
    let layout = DualPanelLayout::default();
    let engine = Arc::new(GatedEngine::default());
    let compositor = Compositor::with_engine(
        CompositorConfig {
            buffering: Buffering::Single,
            ..CompositorConfig::default()
        },
        &mut layout.heap_provider(),
        &layout.surface_ids(),
        layout.format,
        engine.clone(),
    )
    .unwrap();

    compositor.request_flush(Rect::new(950, 0, 970, 5), || {}).unwrap();
    let buffer = compositor.canvas().draw_buffer().clone();
    assert_eq!(buffer.in_flight(), 2);

    let (tx, rx) = mpsc::channel();
    let drawer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            let mut pixels = buffer.write();
            pixels[0] = 1;
            tx.send(()).unwrap();
        })
    };
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    for item in std::mem::take(&mut *engine.held.lock().unwrap()) {
        item.run();
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    drawer.join().unwrap();
}

#[test]
fn double_buffering_alternates_draw_buffers() {
    let (compositor, _provider) = open_default(CompositorConfig::default());
    let canvas = compositor.canvas();
    let first = canvas.draw_buffer().index();

    canvas
        .fill_rect(canvas.draw_buffer(), Rect::new(0, 0, 9, 9), &RED)
        .unwrap();
    wait_for_flush(&compositor, Rect::new(0, 0, 9, 9));

    let second = compositor.swap_buffers();
    assert_ne!(first, second);
    let (old, new) = (&canvas.buffers()[first], &canvas.buffers()[second]);
    canvas.sync_region(old, new, Rect::new(0, 0, 9, 9)).unwrap();
    assert_eq!(&new.read()[..4], &RED);

    // The new buffer flushes the same pixels.
    wait_for_flush(&compositor, Rect::new(0, 0, 9, 9));
    assert_only_lit(&compositor, 0, Some(Rect::new(0, 0, 9, 9)));
}
