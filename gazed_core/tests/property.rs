//! Property tests over the bounded queue and the event detector.
use gazed_core::detector::{DetectorParams, EventDetector, GazeEvent};
use gazed_core::intake::SampleQueue;
use gazed_core::types::GazeSample;
use gazed_traits::RawSample;
use proptest::prelude::*;

fn sample(ts_ns: u64, x: f64, y: f64, conf: f64) -> GazeSample {
    GazeSample::from_raw(&RawSample::at(x, y, conf), ts_ns)
}

proptest! {
    /// Overloading the queue drops entries but never reorders the survivors,
    /// and draining always terminates.
    #[test]
    fn queue_overload_preserves_order(
        capacity in 1usize..64,
        count in 1u64..500,
    ) {
        let q = SampleQueue::new(capacity);
        for i in 1..=count {
            q.push(sample(i, 10.0, 10.0, 0.9));
        }
        let got: Vec<u64> = q.receiver().try_iter().map(|s| s.ts_ns).collect();
        prop_assert!(got.len() <= capacity);
        prop_assert_eq!(*got.last().unwrap(), count, "newest sample survives");
        for w in got.windows(2) {
            prop_assert!(w[0] < w[1]);
        }
        let dropped = q.counters().dropped_overflow.load(std::sync::atomic::Ordering::Relaxed);
        prop_assert_eq!(dropped + got.len() as u64, count);
    }

    /// Whatever the gaze path looks like, emitted events are well formed:
    /// start <= end, fixations meet the minimum duration, and event end
    /// times are monotonic (what the rule engine relies on).
    #[test]
    fn detector_events_are_ordered_and_well_formed(
        steps in proptest::collection::vec((0u64..40, -80.0f64..80.0, 0.3f64..1.0), 10..400),
    ) {
        let params = DetectorParams {
            window_ns: 100_000_000,
            dispersion_px: 30.0,
            min_fixation_ns: 200_000_000,
            confidence_threshold: 0.8,
        };
        let mut det = EventDetector::new(params);
        let mut events: Vec<GazeEvent> = Vec::new();

        let mut ts = 0u64;
        let mut x = 500.0f64;
        let mut y = 400.0f64;
        for (dt_ms, dx, conf) in steps {
            ts += (dt_ms + 1) * 1_000_000;
            x = (x + dx).clamp(0.0, 1920.0);
            y = (y + dx / 2.0).clamp(0.0, 1080.0);
            if let Some(ev) = det.push(ts, x, y, conf) {
                events.push(ev);
            }
        }
        if let Some(ev) = det.finalize() {
            events.push(ev);
        }

        let mut last_end = 0u64;
        for ev in &events {
            match ev {
                GazeEvent::Fixation(f) => {
                    prop_assert!(f.start_ts_ns <= f.end_ts_ns);
                    prop_assert!(f.duration_ms >= 200);
                    prop_assert!(f.sample_count >= 2);
                    prop_assert!(f.end_ts_ns >= last_end);
                    last_end = f.end_ts_ns;
                }
                GazeEvent::Saccade(s) => {
                    prop_assert!(s.start_ts_ns <= s.end_ts_ns);
                    prop_assert!(s.peak_velocity >= 0.0);
                    prop_assert!(s.end_ts_ns >= last_end);
                    last_end = s.end_ts_ns;
                }
            }
        }
    }
}
