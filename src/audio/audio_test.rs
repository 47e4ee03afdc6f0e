use super::*;

fn observer() -> AudioLevel {
    AudioLevel::new(AudioLevelParams {
        active_level: 35,
        min_percentile: 40,
        observe_duration: 200,
        smooth_intervals: 2,
    })
}

#[test]
fn test_active_speaker_crosses_threshold() {
    let level = AudioLevel::new(AudioLevelParams {
        active_level: 35,
        min_percentile: 40,
        observe_duration: 200,
        smooth_intervals: 0,
    });

    // ten 20 ms frames: six louder than the threshold, four silent
    for _ in 0..6 {
        level.observe(30, 20);
    }
    for _ in 0..4 {
        level.observe(100, 20);
    }

    let (smoothed, active) = level.get_level();
    assert!(active);
    assert!(smoothed > convert_audio_level(35.0));
}

#[test]
fn test_fully_active_window() {
    let level = observer();
    for _ in 0..10 {
        level.observe(30, 20);
    }

    let (_, active) = level.get_level();
    assert!(active);
}

#[test]
fn test_quiet_window_resets_to_zero() {
    let level = observer();

    // prime with an active window first
    for _ in 0..10 {
        level.observe(20, 20);
    }
    assert!(level.get_level().1);

    // one full window of silence drops the smoothed level to zero
    for _ in 0..10 {
        level.observe(120, 20);
    }
    let (smoothed, active) = level.get_level();
    assert_eq!(smoothed, 0.0);
    assert!(!active);
}

#[test]
fn test_below_percentile_is_inactive() {
    let level = observer();

    // only 60 ms of 200 ms active, below the 40% minimum
    for _ in 0..3 {
        level.observe(30, 20);
    }
    for _ in 0..7 {
        level.observe(100, 20);
    }

    let (smoothed, active) = level.get_level();
    assert_eq!(smoothed, 0.0);
    assert!(!active);
}

#[test]
fn test_nothing_reported_mid_window() {
    let level = observer();
    for _ in 0..5 {
        level.observe(10, 20);
    }
    // window not complete yet
    let (smoothed, active) = level.get_level();
    assert_eq!(smoothed, 0.0);
    assert!(!active);
}

#[test]
fn test_smoothing_converges() {
    let level = observer();

    let mut previous = 0.0;
    for _ in 0..5 {
        for _ in 0..10 {
            level.observe(25, 20);
        }
        let (smoothed, _) = level.get_level();
        assert!(smoothed >= previous);
        previous = smoothed;
    }
    // EMA approaches the steady-state level from below
    assert!(previous <= convert_audio_level(25.0) + 1e-9);
}