//! Thread-local storage for worker identification.

use std::cell::Cell;

thread_local! {
    /// Id of the loader worker running on this thread (0 to num_workers-1).
    ///
    /// Set once when the worker is spawned and read back for log fields and
    /// error context. The caller's thread reports 0.
    pub static WORKER_ID: Cell<usize> = const { Cell::new(0) };
}

pub fn current_worker_id() -> usize {
    WORKER_ID.with(Cell::get)
}
