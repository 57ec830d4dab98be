//! Host fences: a flag guarded by a mutex and a condition variable.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::NativeFence;

#[derive(Default)]
pub struct HostFence {
    signalled: Mutex<bool>,
    changed: Condvar,
}

impl HostFence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NativeFence for HostFence {
    fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.changed.notify_all();
    }

    fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signalled = self.signalled.lock();
        match timeout {
            None => {
                while !*signalled {
                    self.changed.wait(&mut signalled);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signalled {
                    if self.changed.wait_until(&mut signalled, deadline).timed_out() {
                        return *signalled;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_times_out() {
        let fence = HostFence::new();
        assert!(!fence.wait(Some(Duration::from_millis(10))));
        assert!(!fence.is_signalled());
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let fence = Arc::new(HostFence::new());
        let waiter = {
            let fence = Arc::clone(&fence);
            std::thread::spawn(move || fence.wait(None))
        };
        fence.signal();
        assert!(waiter.join().unwrap());
        assert!(fence.is_signalled());
    }
}
