//! Helpers shared by the unit tests.

use std::panic;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

pub mod mock_vm;

/// Run `f` on a fresh thread and fail the test if it does not finish within
/// `millis` milliseconds. Catches spins on a lock that is never released.
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let result = f();
        done_tx.send(()).expect("test thread could not report completion");
        result
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(()) => worker.join().expect("test thread panicked"),
        Err(e) => panic!("test thread did not finish in {} ms: {}", millis, e),
    }
}

lazy_static! {
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Run `f` while no other serial test runs. Tests that touch process-wide
/// state, such as `GCHANDLES_` environment variables, use this.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // A failed test poisons the lock. The others still need to run.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Run `test`, then `cleanup` even if `test` panicked.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let result = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = result {
        panic::resume_unwind(e);
    }
}
