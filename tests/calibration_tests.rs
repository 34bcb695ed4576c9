mod common;

use chrono::{DateTime, Utc};
use common::*;
use observatory::calibration::{CalibrationError, CalibrationSequencer};
use observatory::clock::{Clock, Observing, SimulatedClock};
use observatory::config::{CalibrationConfig, ImagerConfig};
use observatory::ephemeris::{sun_altitude, NightTimes};
use observatory::instruments::{FrameType, Imager};
use std::sync::Arc;

struct Bench {
    clock: SimulatedClock,
    camera: Arc<FakeCamera>,
    telescope: Arc<FakeTelescope>,
    observing: Observing,
    sequencer: CalibrationSequencer,
    _dir: tempfile::TempDir,
}

fn bench(start: DateTime<Utc>, camera: FakeCamera, config: CalibrationConfig) -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let (clock, shared) = simulated_clock(start);
    let camera = Arc::new(camera);
    let telescope = Arc::new(FakeTelescope::default());
    let observing = Observing::new();
    let imager = Imager::new(
        camera.clone(),
        Arc::clone(&shared),
        ImagerConfig::default(),
        dir.path(),
        "n20240321",
    )
    .unwrap();
    let sequencer = CalibrationSequencer::new(
        Arc::new(imager),
        telescope.clone(),
        shared,
        observing.clone(),
        mount_hopkins(),
        config,
    );
    Bench {
        clock,
        camera,
        telescope,
        observing,
        sequencer,
        _dir: dir,
    }
}

fn tonight() -> NightTimes {
    NightTimes::compute(&mount_hopkins(), at(2024, 3, 20, 22, 0, 0)).unwrap()
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

#[tokio::test]
async fn test_bias_and_dark_batches() {
    let config = CalibrationConfig {
        bias_count: 3,
        dark_count: 2,
        ..CalibrationConfig::default()
    };
    let b = bench(at(2024, 3, 20, 22, 0, 0), FakeCamera::linear(3200.0, 400.0), config);

    let biases = b.sequencer.biases().await.unwrap();
    let darks = b.sequencer.darks().await.unwrap();

    assert_eq!(biases.len(), 3);
    assert_eq!(darks.len(), 2);
    assert!(biases[0].ends_with("n20240321.T3.Bias.0001.fits"));
    assert!(darks[1].ends_with("n20240321.T3.Dark.0005.fits"));

    let bias_frames = b.camera.of_type(FrameType::Bias);
    assert!(bias_frames.iter().all(|e| e.seconds == 0.0 && e.filter == "V"));
    let dark_frames = b.camera.of_type(FrameType::Dark);
    assert!(dark_frames.iter().all(|e| e.seconds == 60.0));
}

#[tokio::test]
async fn test_batch_stops_when_observing_stops() {
    let b = bench(
        at(2024, 3, 20, 22, 0, 0),
        FakeCamera::linear(3200.0, 400.0),
        CalibrationConfig::default(),
    );
    b.observing.stop();

    let err = b.sequencer.biases().await.unwrap_err();

    assert!(matches!(err, CalibrationError::Stopped { taken: 0, requested: 11 }));
    assert!(b.camera.exposures().is_empty());
}

#[tokio::test]
async fn test_evening_flats_converge_in_filter_order() {
    let start = tonight().sunset + chrono::Duration::minutes(5);
    let config = CalibrationConfig {
        flat_count: 5,
        ..CalibrationConfig::default()
    };
    let b = bench(start, FakeCamera::linear(3200.0, 400.0), config);

    let report = b
        .sequencer
        .twilight_flats(&strings(&["V", "B"]), false, 5)
        .await
        .unwrap();

    assert_eq!(report.skipped, None);
    assert_eq!(report.accepted, vec![("B".to_string(), 5), ("V".to_string(), 5)]);
    assert_eq!(report.total(), 10);

    let flats = b.camera.of_type(FrameType::SkyFlat);
    assert_eq!(flats.len(), 10);
    // Starts at the shortest exposure and settles where mean hits the target.
    assert_eq!(flats[0].seconds, 10.0);
    assert!((flats[1].seconds - 17.0).abs() < 1e-9);
    // Exposure resets for the next filter.
    assert_eq!(flats[5].seconds, 10.0);
    assert!(b.camera.discarded().is_empty());

    let slews = b.telescope.slews.lock().unwrap().clone();
    assert_eq!(slews.len(), 10);
    // Sun sets in the west, so flats point east.
    assert!(slews.iter().all(|(alt, az)| *alt == 75.0 && (45.0..135.0).contains(az)));
}

#[tokio::test]
async fn test_rejected_flats_are_discarded() {
    let config = CalibrationConfig {
        max_flat_attempts: 4,
        ..CalibrationConfig::default()
    };
    let start = tonight().sunset + chrono::Duration::minutes(5);
    // Far too bright even at the shortest exposure.
    let b = bench(start, FakeCamera::linear(3200.0, 5000.0), config);

    let report = b.sequencer.twilight_flats(&strings(&["V"]), false, 5).await.unwrap();

    assert_eq!(report.accepted, vec![("V".to_string(), 0)]);
    assert_eq!(b.camera.of_type(FrameType::SkyFlat).len(), 4);
    assert_eq!(b.camera.discarded().len(), 4);
    assert!(b.camera.discarded().iter().all(|path| !path.exists()));
}

#[tokio::test]
async fn test_morning_flats_stop_when_pinned_at_minimum() {
    let start = tonight().sunrise - chrono::Duration::minutes(20);
    let b = bench(start, FakeCamera::linear(3200.0, 2000.0), CalibrationConfig::default());
    assert!(sun_altitude(&mount_hopkins(), start) > -12.0);

    let report = b.sequencer.twilight_flats(&strings(&["V"]), true, 5).await.unwrap();

    assert_eq!(report.accepted, vec![("V".to_string(), 0)]);
    let flats = b.camera.of_type(FrameType::SkyFlat);
    // Longest exposure saturates, the shortest still does: give up.
    assert_eq!(flats.iter().map(|e| e.seconds).collect::<Vec<_>>(), vec![60.0, 10.0]);
}

#[tokio::test]
async fn test_morning_flats_run_most_transmissive_first() {
    let start = tonight().sunrise - chrono::Duration::minutes(20);
    let b = bench(start, FakeCamera::linear(3200.0, 100.0), CalibrationConfig::default());

    let report = b
        .sequencer
        .twilight_flats(&strings(&["B", "V"]), true, 1)
        .await
        .unwrap();

    let order: Vec<&str> = report.accepted.iter().map(|(f, _)| f.as_str()).collect();
    assert_eq!(order, vec!["V", "B"]);
}

#[tokio::test]
async fn test_morning_flats_skipped_in_the_evening() {
    let start = tonight().sunset + chrono::Duration::minutes(5);
    let b = bench(start, FakeCamera::linear(3200.0, 400.0), CalibrationConfig::default());

    let report = b.sequencer.twilight_flats(&strings(&["V"]), true, 5).await.unwrap();

    assert!(report.skipped.is_some());
    assert!(b.camera.exposures().is_empty());
}

#[tokio::test]
async fn test_evening_flats_skipped_once_too_dark() {
    let start = tonight().sunset + chrono::Duration::hours(2);
    let b = bench(start, FakeCamera::linear(3200.0, 400.0), CalibrationConfig::default());

    let report = b.sequencer.twilight_flats(&strings(&["V"]), false, 5).await.unwrap();

    assert!(report.skipped.unwrap().contains("too low"));
    assert!(b.camera.exposures().is_empty());
}

#[tokio::test]
async fn test_flats_wait_for_twilight() {
    let start = tonight().sunset - chrono::Duration::minutes(30);
    let b = bench(start, FakeCamera::linear(3200.0, 400.0), CalibrationConfig::default());

    let report = b.sequencer.twilight_flats(&strings(&["V"]), false, 1).await.unwrap();

    assert_eq!(report.total(), 1);
    // Starts the configured five minutes ahead of sunset.
    let waited = b.clock.now() - start;
    assert!(waited >= chrono::Duration::minutes(25), "waited {waited}");
}

#[tokio::test]
async fn test_twilight_too_far_away_is_skipped() {
    let b = bench(
        at(2024, 3, 20, 20, 0, 0),
        FakeCamera::linear(3200.0, 400.0),
        CalibrationConfig::default(),
    );

    let report = b.sequencer.twilight_flats(&strings(&["V"]), false, 1).await.unwrap();

    assert!(report.skipped.unwrap().contains("too far"));
    assert_eq!(b.clock.now(), at(2024, 3, 20, 20, 0, 0));
}

#[tokio::test]
async fn test_flats_skip_filters_the_camera_lacks() {
    let start = tonight().sunset + chrono::Duration::minutes(5);
    let b = bench(start, FakeCamera::linear(3200.0, 400.0), CalibrationConfig::default());

    let report = b
        .sequencer
        .twilight_flats(&strings(&["Ha"]), false, 1)
        .await
        .unwrap();

    assert!(report.accepted.is_empty());
    assert!(b.camera.exposures().is_empty());
}

#[tokio::test]
async fn test_winter_evening_flats_run_the_same_evening() {
    let december = NightTimes::compute(&mount_hopkins(), at(2024, 12, 1, 21, 0, 0)).unwrap();
    assert_eq!(december.sunset.date_naive(), at(2024, 12, 2, 0, 0, 0).date_naive());
    let start = december.sunset + chrono::Duration::minutes(5);
    let b = bench(start, FakeCamera::linear(3200.0, 400.0), CalibrationConfig::default());

    let report = b.sequencer.twilight_flats(&strings(&["V"]), false, 1).await.unwrap();

    assert_eq!(report.skipped, None);
    assert_eq!(report.total(), 1);
}
