//! Integration tests for tether-timer

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tether_timer::*;

fn service() -> TimerService {
    TimerService::with_config(
        TimerServiceConfig::default()
            .with_idle_timeout(Duration::from_millis(100))
            .with_max_sleep(Duration::from_millis(10)),
    )
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn test_cancel_races_fire_exactly_once() {
    let service = service();
    let queue = service.create_queue(2).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let timers: Vec<Timer> = (0..500)
        .map(|_| {
            let fired = Arc::clone(&fired);
            queue.create_timer(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let cancelled = std::thread::scope(|scope| {
        let handles: Vec<_> = timers
            .chunks(125)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|t| {
                            std::thread::sleep(Duration::from_micros(10));
                            usize::from(t.cancel())
                        })
                        .sum::<usize>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
    });

    assert!(wait_until(Duration::from_secs(5), || queue.pending() == 0));
    assert_eq!(fired.load(Ordering::SeqCst) + cancelled, 500);

    // A second round of cancels changes nothing.
    assert!(timers.iter().all(|t| !t.cancel()));
}

#[test]
fn test_queues_of_different_durations_fire_in_deadline_order() {
    let service = service();
    let slow = service.create_queue(60).unwrap();
    let fast = service.create_queue(5).unwrap();
    let order = Arc::new(support::Order::default());

    let o = Arc::clone(&order);
    let _slow = slow.create_timer(move |_| o.push("slow"));
    let o = Arc::clone(&order);
    let _fast = fast.create_timer(move |_| o.push("fast"));

    assert!(wait_until(Duration::from_secs(5), || order.len() == 2));
    assert_eq!(order.snapshot(), vec!["fast", "slow"]);
}

#[test]
fn test_time_remaining_counts_down() {
    let clock = Arc::new(ManualTicks::new(1_000));
    let service = TimerService::with_clock(TimerServiceConfig::default(), clock.clone());
    let queue = service.create_queue(300).unwrap();
    let timer = queue.create_deadline();

    assert_eq!(timer.start_tick(), 1_000);
    assert_eq!(timer.duration_ms(), Some(300));
    assert_eq!(timer.time_remaining(), Some(Duration::from_millis(300)));

    clock.advance(299);
    assert_eq!(timer.time_remaining(), Some(Duration::from_millis(1)));
    assert!(!timer.has_expired());

    clock.advance(1);
    assert!(timer.has_expired());
    service.shutdown();
}

mod support {
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Order(Mutex<Vec<&'static str>>);

    impl Order {
        pub fn push(&self, label: &'static str) {
            self.0.lock().unwrap().push(label);
        }

        pub fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        pub fn snapshot(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }
}
