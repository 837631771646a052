use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

/// Runs every thunk on at most `max_concurrency` worker threads and joins.
///
/// `result[i]` is the value of `thunks[i]` whatever order the workers finish
/// in. Thunks report failure through their return value, so one failing
/// member never stops its siblings.
pub fn run_all<T, F>(thunks: Vec<F>, max_concurrency: usize) -> Vec<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    let total = thunks.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = max_concurrency.clamp(1, total);
    let queue = Mutex::new(thunks.into_iter().enumerate().collect::<VecDeque<_>>());
    let (tx, rx) = mpsc::channel::<(usize, T)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || loop {
                let next = match queue.lock() {
                    Ok(mut pending) => pending.pop_front(),
                    Err(poisoned) => poisoned.into_inner().pop_front(),
                };
                let Some((index, thunk)) = next else {
                    break;
                };
                let _ = tx.send((index, thunk()));
            });
        }
    });
    drop(tx);

    let mut slots = (0..total).map(|_| None).collect::<Vec<Option<T>>>();
    for (index, value) in rx {
        slots[index] = Some(value);
    }
    slots.into_iter().flatten().collect()
}
