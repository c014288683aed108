//! Overlay render loop
//!
//! Repaints tracked-object annotations over the current frame at a fixed
//! rate. The loop reads only cached `watch` values (latest snapshot, latest
//! frame size), so its cadence is independent of metadata arrival and of
//! any network I/O.

mod draw_list;

pub use draw_list::{DrawList, DrawOp};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::media::FrameSize;
use crate::{Snapshot, TrackedObject, OVERSPEED_KMH};

/// 8-bit RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Box and speed color for objects above the speed limit (#ff3333)
pub const OVERSPEED_COLOR: Rgba = Rgba::rgb(0xff, 0x33, 0x33);
/// Box and speed color for everything else (#33ff33)
pub const NORMAL_COLOR: Rgba = Rgba::rgb(0x33, 0xff, 0x33);
/// Label background, 70% black
pub const PLATE_BACKGROUND: Rgba = Rgba::rgba(0, 0, 0, 178);
pub const TEXT_COLOR: Rgba = Rgba::rgb(0xff, 0xff, 0xff);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Font {
    /// Pixel size
    pub size: f64,
    pub bold: bool,
}

pub const SPEED_FONT: Font = Font { size: 16.0, bold: true };
pub const PLATE_FONT: Font = Font { size: 14.0, bold: false };
pub const TRACK_ID_FONT: Font = Font { size: 14.0, bold: true };

const BOX_LINE_WIDTH: f64 = 3.0;
/// Horizontal padding inside the label plate and before the track id
const TEXT_PADDING: f64 = 5.0;
const LABEL_HEIGHT: f64 = 45.0;
/// Space between the label plate and the box
const LABEL_GAP: f64 = 5.0;
const FIRST_LINE_BASELINE: f64 = 20.0;
const SECOND_LINE_BASELINE: f64 = 38.0;

/// Axis-aligned rectangle in surface pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// True if `other` lies entirely inside `self`
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// 2D drawing target owned by the render loop
pub trait Surface: Send {
    /// Match the surface to the frame dimensions
    fn resize(&mut self, size: FrameSize);

    fn size(&self) -> FrameSize;

    /// Drop everything drawn so far
    fn clear(&mut self);

    fn stroke_rect(&mut self, rect: Rect, color: Rgba, line_width: f64);

    fn fill_rect(&mut self, rect: Rect, color: Rgba);

    /// Draw text with its baseline at `y`
    fn fill_text(&mut self, text: &str, x: f64, y: f64, font: Font, color: Rgba);

    /// Advance width of `text` in pixels
    fn measure_text(&self, text: &str, font: Font) -> f64;
}

/// Highest tick rate the render loop runs at
pub const MAX_FPS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfig {
    /// Ticks per second
    pub fps: u32,
    /// Surface size until the first frame is decoded
    pub default_frame: FrameSize,
    /// Speeds strictly above this are drawn as overspeed (km/h)
    pub overspeed_kmh: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            default_frame: FrameSize::default(),
            overspeed_kmh: OVERSPEED_KMH,
        }
    }
}

impl RenderConfig {
    /// Tick rate clamped to `1..=MAX_FPS`
    pub fn effective_fps(&self) -> u32 {
        self.fps.clamp(1, MAX_FPS)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.effective_fps()
    }
}

/// First label line
pub fn speed_text(speed: Option<f64>) -> String {
    match speed {
        Some(speed) => format!("{speed:.0} km/h"),
        None => "-- km/h".to_string(),
    }
}

/// Second label line
pub fn plate_text(plate: Option<&str>) -> &str {
    match plate {
        Some(plate) if !plate.trim().is_empty() => plate,
        _ => "N/A",
    }
}

/// Label plate for a box: sized to the text, right-aligned with the box,
/// above it, and kept inside the surface.
fn label_plate(bbox: &Rect, text_width: f64, surface: FrameSize) -> Rect {
    let width = text_width + 2.0 * TEXT_PADDING;
    let max_x = (surface.width as f64 - width).max(0.0);
    let max_y = (surface.height as f64 - LABEL_HEIGHT).max(0.0);
    let x = (bbox.right() - LABEL_GAP - width).clamp(0.0, max_x);
    let y = (bbox.y - LABEL_GAP - LABEL_HEIGHT).clamp(0.0, max_y);
    Rect::new(x, y, width, LABEL_HEIGHT)
}

fn paint_object(surface: &mut dyn Surface, object: &TrackedObject, config: &RenderConfig) {
    let color = if object.is_overspeed(config.overspeed_kmh) {
        OVERSPEED_COLOR
    } else {
        NORMAL_COLOR
    };
    let bbox = Rect::new(object.x, object.y, object.width, object.height);
    surface.stroke_rect(bbox, color, BOX_LINE_WIDTH);
    surface.fill_text(
        &format!("#{}", object.track_id),
        bbox.x + TEXT_PADDING,
        bbox.y + FIRST_LINE_BASELINE,
        TRACK_ID_FONT,
        color,
    );

    let speed = speed_text(object.speed);
    let plate = plate_text(object.plate.as_deref());
    let text_width = surface
        .measure_text(&speed, SPEED_FONT)
        .max(surface.measure_text(plate, PLATE_FONT));
    let background = label_plate(&bbox, text_width, surface.size());

    surface.fill_rect(background, PLATE_BACKGROUND);
    surface.fill_text(
        &speed,
        background.x + TEXT_PADDING,
        background.y + FIRST_LINE_BASELINE,
        SPEED_FONT,
        color,
    );
    surface.fill_text(
        plate,
        background.x + TEXT_PADDING,
        background.y + SECOND_LINE_BASELINE,
        PLATE_FONT,
        TEXT_COLOR,
    );
}

/// Paint one frame: resize, clear, then annotate objects in snapshot order
pub fn paint(
    surface: &mut dyn Surface,
    objects: &[TrackedObject],
    frame: Option<FrameSize>,
    config: &RenderConfig,
) {
    surface.resize(frame.unwrap_or(config.default_frame));
    surface.clear();
    for object in objects {
        paint_object(surface, object, config);
    }
}

/// Fixed-rate overlay painter
pub struct RenderLoop<S> {
    surface: S,
    snapshots: watch::Receiver<Snapshot>,
    frame_size: watch::Receiver<Option<FrameSize>>,
    config: RenderConfig,
    ticks: u64,
}

impl<S: Surface> RenderLoop<S> {
    pub fn new(
        surface: S,
        snapshots: watch::Receiver<Snapshot>,
        frame_size: watch::Receiver<Option<FrameSize>>,
        config: RenderConfig,
    ) -> Self {
        Self {
            surface,
            snapshots,
            frame_size,
            config,
            ticks: 0,
        }
    }

    /// Paint one frame from whatever is cached right now
    pub fn tick(&mut self) {
        // Clone the Arc so the watch lock is not held while painting
        let snapshot = self.snapshots.borrow().clone();
        let frame = *self.frame_size.borrow();
        paint(&mut self.surface, &snapshot, frame, &self.config);
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }
}

impl<S: Surface + 'static> RenderLoop<S> {
    /// Drive the loop on a timer until the handle is closed.
    ///
    /// Missed ticks are skipped rather than bunched up.
    pub fn spawn(mut self) -> RenderHandle<S> {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(self.ticks));
        let period = self.config.tick_period();

        let task = {
            let cancel = cancel.clone();
            let ticks = ticks.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!("Render loop started at {} fps", self.config.effective_fps());
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            self.tick();
                            ticks.store(self.ticks, Ordering::Relaxed);
                        }
                    }
                }
                debug!(ticks = self.ticks, "Render loop stopped");
                self
            })
        };

        RenderHandle {
            cancel,
            ticks,
            task: Some(task),
        }
    }
}

/// Running render loop
pub struct RenderHandle<S> {
    cancel: CancellationToken,
    ticks: Arc<AtomicU64>,
    /// Taken by `close`
    task: Option<JoinHandle<RenderLoop<S>>>,
}

impl<S> RenderHandle<S> {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop ticking and hand the loop back so it can be restarted.
    ///
    /// `None` if the task panicked.
    pub async fn close(mut self) -> Option<RenderLoop<S>> {
        self.cancel.cancel();
        self.task.take()?.await.ok()
    }
}

impl<S> Drop for RenderHandle<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::empty_snapshot;

    fn object(id: i64, speed: Option<f64>, plate: Option<&str>) -> TrackedObject {
        TrackedObject {
            track_id: id,
            x: 400.0,
            y: 300.0,
            width: 200.0,
            height: 120.0,
            speed,
            plate: plate.map(str::to_string),
        }
    }

    fn render_loop(
        objects: Vec<TrackedObject>,
    ) -> (
        RenderLoop<DrawList>,
        watch::Sender<Snapshot>,
        watch::Sender<Option<FrameSize>>,
    ) {
        let (snap_tx, snap_rx) = watch::channel(Snapshot::from(objects));
        let (frame_tx, frame_rx) = watch::channel(None);
        let render = RenderLoop::new(DrawList::new(), snap_rx, frame_rx, RenderConfig::default());
        (render, snap_tx, frame_tx)
    }

    fn painted(objects: &[TrackedObject], frame: Option<FrameSize>) -> DrawList {
        let mut surface = DrawList::new();
        paint(&mut surface, objects, frame, &RenderConfig::default());
        surface
    }

    #[test]
    fn overspeed_is_strictly_above_limit() {
        let list = painted(
            &[
                object(1, Some(60.0), None),
                object(2, Some(60.5), None),
                object(3, None, None),
            ],
            None,
        );
        let colors: Vec<Rgba> = list
            .ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::StrokeRect { color, .. } => Some(*color),
                _ => None,
            })
            .collect();
        assert_eq!(colors, vec![NORMAL_COLOR, OVERSPEED_COLOR, NORMAL_COLOR]);
    }

    #[test]
    fn object_draws_box_id_and_two_line_label() {
        let list = painted(&[object(17, Some(72.4), Some("12가3456"))], None);
        let ops = list.ops();
        assert_eq!(ops.len(), 5);

        assert!(matches!(
            &ops[0],
            DrawOp::StrokeRect { rect, color: OVERSPEED_COLOR, line_width }
                if *rect == Rect::new(400.0, 300.0, 200.0, 120.0) && *line_width == 3.0
        ));
        assert_eq!(list.texts(), vec!["#17", "72 km/h", "12가3456"]);
        match &ops[1] {
            DrawOp::FillText { x, y, .. } => {
                assert_eq!(*x, 405.0);
                assert_eq!(*y, 320.0);
            }
            other => panic!("expected track id text, got {other:?}"),
        }
        assert!(matches!(&ops[2], DrawOp::FillRect { color: PLATE_BACKGROUND, .. }));
    }

    #[test]
    fn missing_plate_shows_placeholder() {
        let list = painted(&[object(1, Some(30.0), None), object(2, Some(30.0), Some(" "))], None);
        let texts = list.texts();
        assert_eq!(texts.iter().filter(|t| **t == "N/A").count(), 2);
    }

    #[test]
    fn label_plate_follows_text_width() {
        let short = painted(&[object(1, Some(5.0), Some("AB"))], None);
        let long = painted(&[object(1, Some(5.0), Some("VERY-LONG-PLATE-0001"))], None);

        let short_plate = short.fill_rects()[0];
        let long_plate = long.fill_rects()[0];
        assert!(long_plate.width > short_plate.width);

        // Both stay right-aligned with the box
        for plate in [short_plate, long_plate] {
            assert!((plate.right() - (600.0 - LABEL_GAP)).abs() < 1e-9);
        }

        // Wide enough for the widest line plus padding
        let plate_width = long.measure_text("VERY-LONG-PLATE-0001", PLATE_FONT);
        assert_eq!(long_plate.width, plate_width + 2.0 * TEXT_PADDING);
    }

    #[test]
    fn label_plate_is_clamped_into_surface() {
        let mut corner = object(1, Some(90.0), Some("EDGE-CASE"));
        corner.x = 0.0;
        corner.y = 0.0;
        corner.width = 20.0;
        corner.height = 20.0;
        let list = painted(&[corner], Some(FrameSize::new(640, 480)));

        let plate = list.fill_rects()[0];
        let bounds = Rect::new(0.0, 0.0, 640.0, 480.0);
        assert!(bounds.contains(&plate), "plate {plate:?} escapes the surface");
    }

    #[test]
    fn resizes_to_frame_or_default() {
        let list = painted(&[], None);
        assert_eq!(list.size(), FrameSize::new(1280, 720));

        let list = painted(&[], Some(FrameSize::new(1920, 1080)));
        assert_eq!(list.size(), FrameSize::new(1920, 1080));
    }

    #[test]
    fn annotations_never_accumulate() {
        let (mut render, snap_tx, _frame_tx) = render_loop(vec![object(1, Some(10.0), None)]);
        render.tick();
        render.tick();
        assert_eq!(render.surface().stroke_count(), 1);

        snap_tx.send_replace(empty_snapshot());
        render.tick();
        assert_eq!(render.surface().stroke_count(), 0);
        assert_eq!(render.surface().clears(), 3);
    }

    #[test]
    fn ticks_do_not_depend_on_metadata() {
        let (mut render, _snap_tx, _frame_tx) = render_loop(vec![]);
        for _ in 0..10 {
            render.tick();
        }
        assert_eq!(render.ticks(), 10);
        assert!(render.surface().ops().is_empty());
    }

    #[test]
    fn tick_uses_latest_frame_size() {
        let (mut render, _snap_tx, frame_tx) = render_loop(vec![]);
        render.tick();
        assert_eq!(render.surface().size(), FrameSize::new(1280, 720));

        frame_tx.send_replace(Some(FrameSize::new(640, 360)));
        render.tick();
        assert_eq!(render.surface().size(), FrameSize::new(640, 360));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_ticks_at_fixed_rate_without_metadata() {
        let (render, _snap_tx, _frame_tx) = render_loop(vec![object(3, Some(80.0), None)]);
        let handle = render.spawn();

        // 60 Hz: ticks at 0, 16.7, ..., 150 ms
        tokio::time::sleep(Duration::from_millis(158)).await;
        assert_eq!(handle.ticks(), 10);

        let render = handle.close().await.unwrap();
        assert_eq!(render.ticks(), 10);
        assert_eq!(render.surface().stroke_count(), 1);

        // Restartable
        let handle = render.spawn();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(handle.ticks(), 11);
        handle.close().await.unwrap();
    }

    #[test]
    fn speed_text_rounds_and_handles_unknown() {
        assert_eq!(speed_text(Some(59.6)), "60 km/h");
        assert_eq!(speed_text(None), "-- km/h");
    }

    #[test]
    fn zero_fps_is_treated_as_one() {
        let config = RenderConfig {
            fps: 0,
            ..RenderConfig::default()
        };
        assert_eq!(config.tick_period(), Duration::from_secs(1));
    }

    #[test]
    fn fps_is_capped() {
        let config = RenderConfig {
            fps: 2_000_000_000,
            ..RenderConfig::default()
        };
        assert_eq!(config.effective_fps(), MAX_FPS);
        assert_eq!(config.tick_period(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn absurd_fps_still_runs_and_closes() {
        let (render, _snap_tx, _frame_tx) = render_loop(vec![]);
        let render = RenderLoop {
            config: RenderConfig {
                fps: u32::MAX,
                ..RenderConfig::default()
            },
            ..render
        };
        let handle = render.spawn();
        tokio::time::sleep(Duration::from_micros(9_500)).await;
        assert_eq!(handle.ticks(), 10);
        assert!(handle.close().await.is_some());
    }
}
