use oceanview::build::{self, BuildWorkers, SurfaceLayout};
use oceanview::cache::{EntryState, TextureCache};
use oceanview::colormap::{Colorizer, ColormapRegistry};
use oceanview::config::{GridConfig, LatitudeRange};
use oceanview::dataset::{Datasets, RawFrameStore, write_variable};
use oceanview::descriptor::{Bounds, DataMode, Descriptor};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

const FILL: f32 = -1.0e34;

fn grid() -> GridConfig {
    GridConfig {
        width: 4,
        height: 2,
        depth_levels: 2,
    }
}

/// Primary and alternate runs with frames 1..=3 of TEMP.
fn datasets() -> (TempDir, TempDir, Datasets) {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    for frame in 1..=3u32 {
        let base = frame as f32;
        let top = vec![base, base, base, FILL, base, base, base, base];
        let deep = vec![base * 10.0; 8];
        write_variable(a.path(), frame, "TEMP", &[top.clone(), deep.clone()]).unwrap();
        let shifted: Vec<f32> = top.iter().map(|v| if *v == FILL { 0.0 } else { v + 2.0 }).collect();
        write_variable(b.path(), frame, "TEMP", &[shifted, deep]).unwrap();
    }
    let primary = Arc::new(RawFrameStore::open(a.path(), grid(), FILL).unwrap());
    let alternate = Arc::new(RawFrameStore::open(b.path(), grid(), FILL).unwrap());
    (a, b, Datasets::new(primary, Some(alternate)))
}

fn start(slots: usize, datasets: Datasets) -> (Arc<TextureCache>, build::BuildPipeline) {
    let colorizer: Arc<dyn Colorizer> = Arc::new(ColormapRegistry::builtin());
    build::start(
        slots,
        BuildWorkers { io: 2, cpu: 2 },
        datasets,
        colorizer,
        SurfaceLayout::new(grid(), LatitudeRange::default()),
    )
    .unwrap()
}

fn temp(frame: u32) -> Descriptor {
    Descriptor::new(
        frame,
        0,
        "TEMP",
        "grayscale",
        DataMode::Primary,
        false,
        Bounds::new(0.0, 4.0),
    )
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn finish(cache: Arc<TextureCache>, pipeline: build::BuildPipeline) {
    cache.drain();
    drop(cache);
    pipeline.shutdown();
}

#[test]
fn builds_requested_configuration_end_to_end() {
    let (_a, _b, sets) = datasets();
    let (cache, pipeline) = start(1, sets);

    assert!(cache.get_images(0).is_placeholder());
    assert!(cache.request_new_configuration(0, temp(2)).is_empty());
    wait_until("frame 2", || cache.done_with_last_request());

    let pair = cache.get_images(0);
    assert_eq!(pair.descriptor(), Some(&temp(2)));
    assert_eq!(pair.surface().dimensions(), (4, 2));
    // value 2 on [0, 4] is mid grey; grid rows are flipped so the fill cell is on the bottom row
    assert_eq!(pair.surface().get_pixel(0, 0).0[3], 255);
    assert_eq!(pair.surface().get_pixel(3, 1).0, [0, 0, 0, 0]);
    assert_eq!(pair.legend().dimensions(), (1, 500));
    finish(cache, pipeline);
}

#[test]
fn difference_mode_reads_both_runs() {
    let (_a, _b, sets) = datasets();
    let (cache, pipeline) = start(1, sets);

    let diff = temp(1)
        .with_mode(DataMode::Difference)
        .with_bounds(Bounds::new(0.0, 2.0));
    cache.request_new_configuration(0, diff.clone());
    wait_until("difference", || cache.done_with_last_request());

    let pair = cache.get_images(0);
    assert_eq!(pair.descriptor(), Some(&diff));
    // alternate - primary == 2 everywhere except the masked cell
    assert_eq!(pair.surface().get_pixel(0, 1).0, [255, 255, 255, 255]);
    assert_eq!(pair.surface().get_pixel(3, 1).0, [0, 0, 0, 0]);
    finish(cache, pipeline);
}

#[test]
fn failed_build_settles_without_retry() {
    let (_a, _b, sets) = datasets();
    let (cache, pipeline) = start(1, sets);

    let missing = temp(9);
    cache.request_new_configuration(0, missing.clone());
    wait_until("failure", || cache.settled());
    assert_eq!(cache.entry_state(&missing), EntryState::Failed);
    assert!(!cache.done_with_last_request());
    assert!(cache.get_images(0).is_placeholder());

    cache.request_new_configuration(0, temp(1));
    wait_until("recovery", || cache.done_with_last_request());
    assert_eq!(cache.get_images(0).descriptor(), Some(&temp(1)));
    finish(cache, pipeline);
}

#[test]
fn missing_variable_is_rebuilt_when_requested_again() {
    let (a, _b, sets) = datasets();
    let (cache, pipeline) = start(1, sets);

    let salt = temp(1).with_variable("SALT");
    cache.request_new_configuration(0, salt.clone());
    wait_until("missing variable", || cache.settled());
    assert_eq!(cache.entry_state(&salt), EntryState::Failed);

    write_variable(a.path(), 1, "SALT", &[vec![1.0; 8], vec![1.0; 8]]).unwrap();
    cache.request_new_configuration(0, salt.clone());
    wait_until("rebuild", || cache.done_with_last_request());
    assert_eq!(cache.get_images(0).descriptor(), Some(&salt));
    finish(cache, pipeline);
}

#[test]
fn retry_failed_builds_frames_written_later() {
    let (a, _b, sets) = datasets();
    let (cache, pipeline) = start(2, sets);

    let late = temp(4);
    cache.request_new_configuration(0, late.clone());
    cache.request_new_configuration(1, temp(1));
    wait_until("first attempt", || cache.settled());
    assert_eq!(cache.entry_state(&late), EntryState::Failed);
    assert!(cache.get_images(0).is_placeholder());

    write_variable(a.path(), 4, "TEMP", &[vec![1.0; 8], vec![1.0; 8]]).unwrap();
    assert_eq!(cache.retry_failed(), vec![late.clone()]);
    wait_until("late frame", || cache.done_with_last_request());
    assert_eq!(cache.get_images(0).descriptor(), Some(&late));
    finish(cache, pipeline);
}

#[test]
fn rapid_requests_leave_no_orphans() {
    let (_a, _b, sets) = datasets();
    let (cache, pipeline) = start(2, sets);

    for round in 0..30u32 {
        let frame = round % 3 + 1;
        cache.request_new_configuration(0, temp(frame));
        cache.request_new_configuration(1, temp(frame).with_depth(round % 2));
        assert!(cache.snapshot().orphans().is_empty());
    }
    wait_until("last round", || cache.done_with_last_request());
    let snap = cache.snapshot();
    assert!(snap.orphans().is_empty());
    assert!(snap.ready.len() <= 4, "at most two generations per slot");
    finish(cache, pipeline);
}

#[test]
fn concurrent_requests_for_one_descriptor_submit_once() {
    let (_a, _b, sets) = datasets();
    let (cache, pipeline) = start(8, sets);

    let handles: Vec<_> = (0..8)
        .map(|slot| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache.request_new_configuration(slot, temp(3));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    wait_until("shared build", || cache.done_with_last_request());

    let first = cache.get_images(0);
    for slot in 1..8 {
        assert!(Arc::ptr_eq(&first, &cache.get_images(slot)), "slot {slot} shares the pair");
    }
    assert_eq!(cache.snapshot().ready.len(), 1);
    finish(cache, pipeline);
}
