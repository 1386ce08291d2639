//! Reference counting with release callbacks.
//!
//! A [`ReferenceQueue`] tracks how many derived objects (result streams,
//! prepared statements, transactions) still use a shared resource. Callbacks
//! registered with [`ReferenceQueue::on_release`] run exactly once, in
//! registration order, when the count drops back to zero.

use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    count: usize,
    callbacks: Vec<Callback>,
}

/// Outstanding-use counter with "released" callbacks.
#[derive(Default)]
pub struct ReferenceQueue {
    state: Mutex<State>,
}

impl std::fmt::Debug for ReferenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReferenceQueue")
            .field("count", &state.count)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl ReferenceQueue {
    /// Create an empty queue with a count of zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the outstanding-use count.
    pub fn reference(&self) {
        self.state.lock().count += 1;
    }

    /// Decrement the outstanding-use count.
    ///
    /// When the count reaches zero every registered callback is invoked in
    /// registration order and the callback list is cleared.
    ///
    /// # Panics
    ///
    /// Panics if called without a matching [`reference`](Self::reference).
    pub fn unreference(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            assert!(
                state.count > 0,
                "ReferenceQueue::unreference called without a matching reference"
            );
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            std::mem::take(&mut state.callbacks)
        };
        // Run outside the lock so callbacks may touch this queue again.
        for callback in callbacks {
            callback();
        }
    }

    /// Register a callback for the next transition to zero.
    pub fn on_release<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.state.lock().callbacks.push(Box::new(callback));
    }

    /// Run `callback` now if nothing holds a reference, otherwise on the
    /// next transition to zero. The check and the registration happen under
    /// one lock, so a concurrent last `unreference` cannot be missed.
    pub fn on_idle<F: FnOnce() + Send + 'static>(&self, callback: F) {
        {
            let mut state = self.state.lock();
            if state.count > 0 {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Current outstanding-use count.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Returns true when nothing holds a reference.
    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Take a reference that is released when the returned guard drops.
    pub fn hold(self: &Arc<Self>) -> RefGuard {
        self.reference();
        RefGuard {
            queue: Arc::clone(self),
        }
    }
}

/// A scoped reference on a [`ReferenceQueue`].
#[derive(Debug)]
pub struct RefGuard {
    queue: Arc<ReferenceQueue>,
}

impl RefGuard {
    /// The queue this guard holds a reference on.
    pub fn queue(&self) -> &Arc<ReferenceQueue> {
        &self.queue
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.queue.unreference();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fires_once_after_last_unreference() {
        let queue = ReferenceQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        queue.reference();
        queue.reference();
        queue.reference();
        let f = Arc::clone(&fired);
        queue.on_release(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        queue.unreference();
        queue.unreference();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        queue.unreference();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Callback list was cleared; another cycle does not re-run it.
        queue.reference();
        queue.unreference();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interleaved_references() {
        let queue = ReferenceQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        queue.on_release(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        queue.reference();
        queue.reference();
        queue.unreference();
        queue.reference();
        queue.unreference();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(queue.count(), 1);
        queue.unreference();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let queue = ReferenceQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.reference();
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.on_release(move || order.lock().push(i));
        }
        queue.unreference();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_on_idle_runs_now_or_on_release() {
        let queue = Arc::new(ReferenceQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        queue.on_idle(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let guard = queue.hold();
        let f = Arc::clone(&fired);
        queue.on_idle(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_on_idle_races_last_unreference() {
        for _ in 0..200 {
            let queue = Arc::new(ReferenceQueue::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let guard = queue.hold();
            let releaser = std::thread::spawn(move || drop(guard));
            let f = Arc::clone(&fired);
            queue.on_idle(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
            releaser.join().unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let queue = Arc::new(ReferenceQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        queue.on_release(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let a = queue.hold();
        let b = queue.hold();
        drop(a);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_queue() {
        let queue = Arc::new(ReferenceQueue::new());
        let q = Arc::clone(&queue);
        queue.reference();
        queue.on_release(move || {
            q.reference();
        });
        queue.unreference();
        assert_eq!(queue.count(), 1);
    }

    #[test]
    #[should_panic(expected = "without a matching reference")]
    fn test_unbalanced_unreference_panics() {
        let queue = ReferenceQueue::new();
        queue.reference();
        queue.unreference();
        queue.unreference();
    }
}
