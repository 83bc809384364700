use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camera_wall::{
    Console, DisplayGeometry, DisplayId, DisplaySettings, Placeholder, PresentationSink,
    SlotImage, SlotOutput, SourceId, SourceRecord, SupervisorConfig, Topology,
};

type Presented = Arc<Mutex<Vec<Vec<SlotOutput>>>>;

struct CollectingSink(Presented);

impl PresentationSink for CollectingSink {
    fn present(&mut self, _display: DisplayId, slots: &[SlotOutput]) {
        self.0.lock().unwrap().push(slots.to_vec());
    }
}

fn fast_capture() -> SupervisorConfig {
    SupervisorConfig {
        failure_threshold: 3,
        reconnect_cooldown: Duration::from_millis(5),
        poll_interval: Duration::from_millis(1),
    }
}

fn wait_for_frames(console: &Console, ids: &[SourceId]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if ids.iter().all(|id| console.registry().frame(*id).is_some()) {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("sources never produced frames");
}

#[test]
fn grid_of_stub_sources_renders_exact_slot_sizes() {
    let mut console = Console::new(DisplaySettings::default(), fast_capture(), 20);
    for id in 1..=4u64 {
        console
            .add_source(SourceRecord::new(
                id,
                format!("cam{}", id),
                format!("stub://cam{}?width=64&height=48", id),
            ))
            .expect("add source");
    }
    let ids: Vec<SourceId> = (1..=4).map(SourceId).collect();
    wait_for_frames(&console, &ids);

    let presented: Presented = Arc::new(Mutex::new(Vec::new()));
    let t0 = Instant::now();
    console
        .open_display(
            Topology::grid(),
            ids.clone(),
            DisplayGeometry::new(200, 100).with_padding(5),
            Box::new(CollectingSink(presented.clone())),
            t0,
        )
        .expect("open display");
    console.tick(t0);

    let passes = presented.lock().unwrap();
    let slots = passes.last().expect("one render pass");
    assert_eq!(slots.len(), 4);
    for slot in slots.iter() {
        assert_eq!((slot.rect.width, slot.rect.height), (90, 40));
        match &slot.image {
            SlotImage::Image(image) => assert_eq!(image.dimensions(), (90, 40)),
            SlotImage::Placeholder(p) => panic!("slot {} not live: {:?}", slot.slot, p),
        }
    }
    let shown: Vec<Option<SourceId>> = slots.iter().map(|s| s.source).collect();
    assert_eq!(shown, ids.into_iter().map(Some).collect::<Vec<_>>());
}

#[test]
fn dead_source_is_replaced_by_free_source() {
    let mut console = Console::new(DisplaySettings::default(), fast_capture(), 20);
    console
        .add_source(SourceRecord::new(1, "dead", "stub://dead?offline=1"))
        .expect("add source");
    console
        .add_source(SourceRecord::new(2, "alive", "stub://alive?width=32&height=24"))
        .expect("add source");
    wait_for_frames(&console, &[SourceId(2)]);

    let presented: Presented = Arc::new(Mutex::new(Vec::new()));
    let t0 = Instant::now();
    let display = console
        .open_display(
            Topology::Single,
            vec![SourceId(1), SourceId(2)],
            DisplayGeometry::new(80, 60),
            Box::new(CollectingSink(presented.clone())),
            t0,
        )
        .expect("open display");

    console.tick(t0);
    console.tick(t0 + Duration::from_millis(40));

    assert_eq!(
        console.render_plan(display).map(|plan| plan[0].source),
        Some(Some(SourceId(2)))
    );
    let passes = presented.lock().unwrap();
    assert!(matches!(
        passes[0][0].image,
        SlotImage::Placeholder(Placeholder::Loading)
    ));
    match &passes[1][0].image {
        SlotImage::Image(image) => assert_eq!(image.dimensions(), (80, 60)),
        SlotImage::Placeholder(p) => panic!("expected live frame, got {:?}", p),
    }
}

#[test]
fn run_returns_at_deadline_and_shutdown_stops_capture() {
    let mut console = Console::new(DisplaySettings::default(), fast_capture(), 20);
    console
        .add_source(SourceRecord::new(1, "lobby", "stub://lobby?width=16&height=16"))
        .expect("add source");

    let presented: Presented = Arc::new(Mutex::new(Vec::new()));
    console
        .open_display(
            Topology::Single,
            vec![SourceId(1)],
            DisplayGeometry::new(16, 16),
            Box::new(CollectingSink(presented.clone())),
            Instant::now(),
        )
        .expect("open display");

    let stop = AtomicBool::new(false);
    let started = Instant::now();
    console.run(&stop, Some(started + Duration::from_millis(200)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!presented.lock().unwrap().is_empty());

    console.shutdown();
    assert!(console.display_ids().is_empty());
    assert_eq!(console.scheduler().pending(), 0);
    let status = console.registry().status(SourceId(1));
    assert!(status.is_none());
}
