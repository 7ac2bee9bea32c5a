use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A latching wake-up primitive shared between the worker threads: a signal
/// that arrives while nobody is waiting is remembered until the next
/// `wait()`. One exists for the player and one for the decoder; the music
/// pipe signals the player's through its producer side.
#[derive(Debug, Default)]
pub struct Notify {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until signalled (or consume an already-pending signal).
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            pending = self.cond.wait(pending).unwrap();
        }
        *pending = false;
    }

    /// Like [`Notify::wait`] with an upper bound; returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            let (guard, result) = self.cond.wait_timeout(pending, timeout).unwrap();
            pending = guard;
            if result.timed_out() && !*pending {
                return false;
            }
        }
        *pending = false;
        true
    }

    pub fn signal(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_latched() {
        let notify = Notify::new();
        notify.signal();
        notify.wait(); // must not block
    }

    #[test]
    fn wakes_waiting_thread() {
        let notify = Arc::new(Notify::new());
        let other = Arc::clone(&notify);
        let handle = thread::spawn(move || other.wait());
        thread::sleep(Duration::from_millis(20));
        notify.signal();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let notify = Notify::new();
        assert!(!notify.wait_timeout(Duration::from_millis(10)));
        notify.signal();
        assert!(notify.wait_timeout(Duration::from_millis(10)));
    }
}
