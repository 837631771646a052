use procflow::orchestration::run_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn random_delay_ms() -> u64 {
    let mut bytes = [0_u8; 1];
    getrandom::getrandom(&mut bytes).expect("randomness");
    u64::from(bytes[0] % 20)
}

#[test]
fn results_keep_input_order_whatever_the_completion_order() {
    let thunks = (0..12)
        .map(|idx| {
            let delay = random_delay_ms();
            move || {
                thread::sleep(Duration::from_millis(delay));
                idx * 10
            }
        })
        .collect::<Vec<_>>();

    let results = run_all(thunks, 4);
    assert_eq!(results, (0..12).map(|idx| idx * 10).collect::<Vec<_>>());
}

#[test]
fn in_flight_members_never_exceed_the_concurrency_bound() {
    let in_flight = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let thunks = (0..10)
        .map(|_| {
            let in_flight = &in_flight;
            let peak = &peak;
            move || {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(15));
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .collect::<Vec<_>>();

    let results = run_all(thunks, 3);
    assert_eq!(results.len(), 10);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {peak}");
    assert!(peak >= 1);
}

#[test]
fn a_failing_member_does_not_stop_its_siblings() {
    let thunks: Vec<Box<dyn FnOnce() -> Result<u32, String> + Send>> = vec![
        Box::new(|| Ok(1)),
        Box::new(|| Err("lint failed".to_string())),
        Box::new(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(3)
        }),
    ];

    let results = run_all(thunks, 8);
    assert_eq!(
        results,
        vec![Ok(1), Err("lint failed".to_string()), Ok(3)]
    );
}

#[test]
fn empty_groups_return_immediately() {
    let thunks: Vec<fn() -> u8> = Vec::new();
    assert!(run_all(thunks, 4).is_empty());
}

#[test]
fn zero_concurrency_still_runs_sequentially() {
    let thunks: Vec<fn() -> i32> = vec![|| 1, || 2];
    let results = run_all(thunks, 0);
    assert_eq!(results, vec![1, 2]);
}
