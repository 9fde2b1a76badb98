use std::{sync::Arc, thread, time::Duration};

use loopstation_core::{
    JsonProjectStore, LoopStation, LoopStationError, MemoryBackend, MemoryInput, Pacing,
    PcmBuffer, PcmFormat, ProjectSession, RecordingOutcome, DEFAULT_TRACK_COUNT, DEFAULT_VOLUME,
};

fn tone_backend() -> MemoryBackend {
    MemoryBackend::new(
        Pacing::RealTime,
        MemoryInput::Tone {
            frequency_hz: 440.0,
            amplitude: 0.5,
        },
    )
}

fn station(backend: &MemoryBackend) -> LoopStation {
    LoopStation::new(Arc::new(backend.clone()), DEFAULT_TRACK_COUNT).unwrap()
}

fn load_track(station: &mut LoopStation, number: usize, bytes: usize) {
    station
        .track_mut(number)
        .unwrap()
        .set_audio_data(PcmBuffer::new(vec![0x20; bytes]))
        .unwrap();
}

#[test]
fn two_second_take_lands_on_track_one() {
    let backend = tone_backend();
    let mut station = station(&backend);

    assert_eq!(station.start_recording().unwrap(), 1);
    thread::sleep(Duration::from_secs(2));
    let outcome = station.stop_recording().unwrap();

    let RecordingOutcome::Stored { track, bytes } = outcome else {
        panic!("expected stored recording, got {outcome:?}");
    };
    assert_eq!(track, 1);
    // roughly two seconds of audio, give or take a frame of scheduling slack
    let expected = PcmFormat::STATION.bytes_for(Duration::from_secs(2));
    assert!(bytes > expected / 2 && bytes < expected * 2, "{bytes} bytes");

    assert!(station.track(1).unwrap().has_audio());
    for number in 2..=4 {
        assert!(!station.track(number).unwrap().has_audio());
    }
    // capture thread joined and device released before stop returned
    assert!(!backend.input_in_use());
}

#[test]
fn play_all_runs_one_thread_per_loaded_track() {
    let backend = MemoryBackend::realtime();
    let mut station = station(&backend);
    load_track(&mut station, 1, 8192);
    load_track(&mut station, 2, 4096);

    let outcome = station.play_all().unwrap();
    assert_eq!(outcome.playing, vec![1, 2]);
    assert!(outcome.failed.is_empty());
    assert_eq!(backend.writers_active(), 2);

    // already playing tracks are left alone
    station.play_all().unwrap();
    assert_eq!(backend.writers_active(), 2);

    station.stop_all().unwrap();
    assert_eq!(backend.writers_active(), 0);
    assert!(station.tracks().iter().all(|t| !t.is_playing()));
}

#[test]
fn clear_all_resets_every_track() {
    let backend = MemoryBackend::realtime();
    let mut station = station(&backend);
    load_track(&mut station, 1, 4096);
    load_track(&mut station, 3, 4096);
    station.set_track_volume(1, 0.1).unwrap();
    station.set_track_muted(3, true).unwrap();
    station.set_track_volume(4, 0.6).unwrap();
    station.play_all().unwrap();

    station.clear_all();

    for track in station.tracks() {
        assert!(!track.has_audio());
        assert!(!track.is_playing());
        assert_eq!(track.volume(), DEFAULT_VOLUME);
        assert!(!track.is_muted());
    }
    assert_eq!(backend.outputs_open(), 0);
    assert!(!station.is_playing_all());
}

#[test]
fn recording_is_exclusive_until_stopped() {
    let backend = MemoryBackend::realtime();
    let mut station = station(&backend);

    station.start_recording().unwrap();
    for _ in 0..3 {
        assert!(matches!(
            station.start_recording(),
            Err(LoopStationError::CaptureAlreadyActive)
        ));
    }
    thread::sleep(Duration::from_millis(60));
    station.stop_recording().unwrap();

    assert_eq!(station.start_recording().unwrap(), 2);
    station.stop_recording().unwrap();
}

#[test]
fn full_station_refuses_to_record() {
    let backend = MemoryBackend::realtime();
    let mut station = station(&backend);
    for number in 1..=DEFAULT_TRACK_COUNT {
        load_track(&mut station, number, 64);
    }

    assert!(matches!(
        station.start_recording(),
        Err(LoopStationError::NoFreeTrack)
    ));
    assert!(!backend.input_in_use());
}

#[test]
fn recorded_takes_survive_a_project_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = tone_backend();
    let store = JsonProjectStore::open(dir.path()).unwrap();
    let mut session = ProjectSession::new(station(&backend), store);

    let station = session.station_mut();
    station.start_recording().unwrap();
    thread::sleep(Duration::from_millis(150));
    station.stop_recording().unwrap();
    station.set_track_volume(1, 0.5).unwrap();
    let recorded = station.track(1).unwrap().audio_data().unwrap().clone();

    let id = session.save("first jam").unwrap();
    session.clear_all();
    assert!(!session.station().has_any_audio());

    session.load(id).unwrap();
    let track = session.station().track(1).unwrap();
    assert_eq!(track.audio_data(), Some(&recorded));
    approx::assert_relative_eq!(track.volume(), 0.5);
    assert_eq!(session.current_project().unwrap().name, "first jam");
}

#[test]
fn unmuting_resumes_without_restarting() {
    let backend = MemoryBackend::realtime();
    let mut station = station(&backend);
    load_track(&mut station, 1, 4096 * 40);
    station.set_track_muted(1, true).unwrap();
    station.play_track(1).unwrap();

    thread::sleep(Duration::from_millis(200));
    let muted_position = station.track(1).unwrap().engine().unwrap().position();
    assert!(muted_position > 0);
    assert_eq!(backend.bytes_written(), 0);

    station.set_track_muted(1, false).unwrap();
    thread::sleep(Duration::from_millis(200));
    let engine = station.track(1).unwrap().engine().unwrap();
    assert!(engine.position() > muted_position);
    assert!(backend.bytes_written() > 0);

    station.stop_track(1).unwrap();
}
