//! Integration tests for the Tidepool event loop: pending-operation
//! counting, idle detection, scheduling and timers

mod common;
use common::{recording_runtime, runtime, PATIENCE};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use pretty_assertions::assert_eq;
use tidepool::{Error, Runtime};

mod counter {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_balanced_pairs_from_many_threads() {
        let runtime = Arc::new(runtime());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    for _ in 0..500 {
                        runtime.increment_pending_operations();
                        runtime.decrement_pending_operations().unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(runtime.pending_operations_count(), 0);
        assert!(runtime.wait_for_idle(Duration::ZERO));
    }

    #[test]
    fn test_underflow_is_reported_and_clamped() {
        let runtime = runtime();
        assert!(matches!(
            runtime.decrement_pending_operations(),
            Err(Error::CounterUnderflow)
        ));
        assert_eq!(runtime.pending_operations_count(), 0);

        // still usable afterwards
        runtime.increment_pending_operations();
        assert_eq!(runtime.pending_operations_count(), 1);
        runtime.decrement_pending_operations().unwrap();
    }
}

mod idle {
    use super::*;

    #[test]
    fn test_idle_immediately_at_zero() {
        let runtime = runtime();
        let started = Instant::now();
        assert!(runtime.wait_for_idle(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wakes_promptly_after_last_decrement() {
        let runtime = Arc::new(runtime());
        runtime.increment_pending_operations();

        let releaser = Arc::clone(&runtime);
        let (tx, rx) = channel::bounded(1);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            releaser.decrement_pending_operations().unwrap();
            tx.send(Instant::now()).unwrap();
        });

        assert!(runtime.wait_for_idle(PATIENCE));
        let woke = Instant::now();
        let released = rx.recv().unwrap();
        assert!(woke.saturating_duration_since(released) <= Duration::from_millis(150));
        worker.join().unwrap();
    }

    #[test]
    fn test_times_out_when_decrement_withheld() {
        let runtime = runtime();
        runtime.increment_pending_operations();

        let started = Instant::now();
        assert!(!runtime.wait_for_idle(Duration::from_millis(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));

        runtime.decrement_pending_operations().unwrap();
        assert!(runtime.wait_for_idle(Duration::ZERO));
    }
}

mod scheduling {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zero_delay_fires_before_later_delay() {
        let runtime = runtime();
        let (tx, rx) = channel::unbounded();

        let late = tx.clone();
        runtime
            .schedule_after(Duration::from_millis(50), move || {
                late.send("b").unwrap();
                Ok(())
            })
            .unwrap();
        runtime
            .schedule_after(Duration::ZERO, move || {
                tx.send("a").unwrap();
                Ok(())
            })
            .unwrap();

        let order: Vec<_> = (0..2).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_equal_delays_fire_in_submission_order() {
        let runtime = runtime();
        let (tx, rx) = channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            runtime
                .schedule_after(Duration::from_millis(20), move || {
                    tx.send(i).unwrap();
                    Ok(())
                })
                .unwrap();
        }
        let order: Vec<_> = (0..10).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancel_repeating_stops_future_firings() {
        let runtime = runtime();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let handle = runtime
            .schedule_repeating(Duration::from_millis(5), move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let deadline = Instant::now() + PATIENCE;
        while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(runtime.cancel(handle));
        let at_cancel = fired.load(Ordering::SeqCst);
        assert!(at_cancel >= 3);

        thread::sleep(Duration::from_millis(60));
        // a firing already dispatched may still land
        assert!(fired.load(Ordering::SeqCst) <= at_cancel + 1);
        assert!(!runtime.cancel(handle));
    }

    #[test]
    fn test_cancelled_blocking_result_is_discarded() {
        let runtime = runtime();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (tx, rx) = channel::bounded(1);

        let handle = runtime.run_blocking(
            move || {
                let _ = gate_rx.recv_timeout(PATIENCE);
                Ok("data")
            },
            move |result| {
                tx.send(matches!(result, Err(Error::Cancelled))).unwrap();
                Ok(())
            },
        );
        assert!(runtime.cancel(handle));
        gate_tx.send(()).unwrap();

        assert!(runtime.wait_for_idle(PATIENCE));
        assert!(rx.recv().unwrap());
    }
}

mod timers {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interval_fires_then_clear_reaches_idle() {
        let runtime = runtime();
        let baseline = runtime.pending_operations_count();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);

        let id = runtime.set_interval(10, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(runtime.pending_operations_count(), baseline + 1);

        let deadline = Instant::now() + PATIENCE;
        while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst) >= 3);

        assert!(runtime.clear_interval(id));
        assert!(runtime.wait_for_idle(PATIENCE));
        assert_eq!(runtime.pending_operations_count(), baseline);
    }

    #[test]
    fn test_clear_before_fire_releases_and_never_runs() {
        let runtime = runtime();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);

        let id = runtime.set_timeout(50, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(runtime.clear_timeout(id));
        assert!(runtime.wait_for_idle(Duration::ZERO));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_and_unknown_clear_are_harmless() {
        let runtime = runtime();
        let (tx, rx) = channel::bounded(1);
        let keep = runtime.set_timeout(30, move || {
            tx.send(()).unwrap();
            Ok(())
        });
        let dropped = runtime.set_timeout(30, || Ok(()));

        assert!(runtime.clear_timeout(dropped));
        assert!(!runtime.clear_timeout(dropped));
        assert!(!runtime.clear_interval(dropped));
        assert!(!runtime.clear_timeout(9_999u64.into()));
        assert_eq!(runtime.pending_operations_count(), 1);

        rx.recv_timeout(PATIENCE).unwrap();
        assert!(runtime.wait_for_idle(PATIENCE));
        assert!(!runtime.clear_timeout(keep));
    }

    #[test]
    fn test_timer_ids_are_monotonic() {
        let runtime = runtime();
        let a = runtime.set_timeout(1_000, || Ok(()));
        let b = runtime.set_interval(1_000, || Ok(()));
        let c = runtime.set_timeout(1_000, || Ok(()));
        assert!(a < b && b < c);
        runtime.shutdown();
        assert_eq!(runtime.pending_operations_count(), 0);
    }

    #[test]
    fn test_interval_can_clear_itself() {
        let runtime = Arc::new(runtime());
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let id_slot = Arc::new(parking_lot::Mutex::new(None));
        let own = Arc::clone(&id_slot);
        let context = runtime.context();

        let id = runtime.set_interval(5, move || {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                if let Some(id) = *own.lock() {
                    context.clear_timer(id);
                }
            }
            Ok(())
        });
        *id_slot.lock() = Some(id);

        assert!(runtime.wait_for_idle(PATIENCE));
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }
}

mod failures {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failing_callbacks_are_reported_and_loop_survives() {
        let (runtime, reported) = recording_runtime();
        runtime.set_timeout(0, || Err(Error::callback("TypeError: boom")));
        runtime.set_timeout(0, || panic!("native bug"));

        let (tx, rx) = channel::bounded(1);
        runtime.set_timeout(20, move || {
            tx.send(()).unwrap();
            Ok(())
        });

        rx.recv_timeout(PATIENCE).unwrap();
        assert!(runtime.wait_for_idle(PATIENCE));

        let reported = reported.lock().clone();
        assert_eq!(reported.len(), 2);
        assert!(reported.iter().any(|r| r.contains("TypeError: boom")));
        assert!(reported.iter().any(|r| r.contains("native bug")));
        assert_eq!(runtime.stats().callback_failures, 2);
    }

    #[test]
    fn test_work_after_shutdown_still_completes_and_releases() {
        let runtime = runtime();
        runtime.shutdown();

        let (tx, rx) = channel::bounded(1);
        runtime.run_blocking(
            || Ok(()),
            move |result| {
                tx.send(matches!(result, Err(Error::SchedulerShutdown))).unwrap();
                Ok(())
            },
        );
        assert!(rx.recv_timeout(PATIENCE).unwrap());
        assert!(runtime.wait_for_idle(PATIENCE));
        assert!(matches!(
            runtime.schedule_after(Duration::ZERO, || Ok(())),
            Err(Error::SchedulerShutdown)
        ));
    }

    #[test]
    fn test_queue_full_still_completes_and_releases() {
        let config = common::test_config().with_worker_threads(1).with_queue_capacity(1);
        let runtime = Runtime::with_config(config).unwrap();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (tx, rx) = channel::unbounded();

        // occupy the worker, then fill the queue
        runtime.run_blocking(
            move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(PATIENCE);
                Ok(())
            },
            |_| Ok(()),
        );
        started_rx.recv_timeout(PATIENCE).unwrap();
        runtime.run_blocking(|| Ok(()), |_| Ok(()));

        runtime.run_blocking(
            || Ok(()),
            move |result| {
                tx.send(matches!(result, Err(Error::QueueFull { capacity: 1 }))).unwrap();
                Ok(())
            },
        );

        assert!(rx.recv_timeout(PATIENCE).unwrap());
        gate_tx.send(()).unwrap();
        assert!(runtime.wait_for_idle(PATIENCE));
        assert_eq!(runtime.stats().blocking_rejected, 1);
    }
}
