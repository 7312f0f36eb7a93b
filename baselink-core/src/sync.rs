//! Synchronizer: a reference counter over outstanding asynchronous work.
//! First increment fires `on_start`, the decrement back to zero fires
//! `on_finish` and wakes every drain-waiter at once.

use std::sync::{Arc, Condvar, Mutex};

type Callback = Box<dyn Fn() + Send + Sync>;

pub struct Synchronizer {
    count: Mutex<i64>,
    drained: Condvar,
    on_start: Callback,
    on_finish: Callback,
}

impl Synchronizer {
    pub fn new(on_start: impl Fn() + Send + Sync + 'static, on_finish: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
            on_start: Box::new(on_start),
            on_finish: Box::new(on_finish),
        }
    }

    /// Increment the counter. Pair every call with exactly one `decrement`,
    /// or use `token` for an RAII pairing.
    pub fn increment(&self) {
        let mut count = self.count.lock().expect("synchronizer lock poisoned");
        *count += 1;
        if *count == 1 {
            (self.on_start)();
        }
    }

    /// Decrement the counter. Going below zero is a bug in the caller's
    /// increment/decrement pairing and panics.
    pub fn decrement(&self) {
        let mut count = self.count.lock().expect("synchronizer lock poisoned");
        *count -= 1;
        if *count == 0 {
            (self.on_finish)();
            self.drained.notify_all();
        } else if *count < 0 {
            panic!("synchronizer count cannot be negative");
        }
    }

    /// Increment and return a token that decrements exactly once, either via
    /// `done()` or on drop.
    pub fn token(self: &Arc<Self>) -> SyncToken {
        self.increment();
        SyncToken {
            synchronizer: Arc::clone(self),
            armed: true,
        }
    }

    /// Block until the counter reaches zero. Returns immediately if it
    /// already is.
    pub fn wait_synchronized(&self) {
        let mut count = self.count.lock().expect("synchronizer lock poisoned");
        while *count > 0 {
            count = self
                .drained
                .wait(count)
                .expect("synchronizer lock poisoned");
        }
    }
}

/// RAII decrement for one `Synchronizer::token` call.
pub struct SyncToken {
    synchronizer: Arc<Synchronizer>,
    armed: bool,
}

impl SyncToken {
    /// Decrement now instead of at drop.
    pub fn done(mut self) {
        self.armed = false;
        self.synchronizer.decrement();
    }
}

impl Drop for SyncToken {
    fn drop(&mut self) {
        if self.armed {
            self.synchronizer.decrement();
        }
    }
}
