//! Completion counter shared between the scheduler and the tasks it waits for.
//!
//! A `WaitGroup` is a cloneable handle to one counter. Producers call [`WaitGroup::add`] before
//! handing out work, consumers call [`WaitGroup::done`] once per unit of work they finish, and
//! the owner of the lifecycle calls [`WaitGroup::wait`] to suspend until the counter drops back
//! to zero.
//!
//! ```
//! # async fn example() {
//! let wg = common::waitgroup::WaitGroup::new();
//! wg.add(1);
//! let worker = wg.clone();
//! tokio::spawn(async move {
//!     // do some work
//!     worker.done();
//! });
//! wg.wait().await;
//! # }
//! ```

#[derive(Debug, Clone)]
pub struct WaitGroup {
    counter: std::sync::Arc<tokio::sync::watch::Sender<usize>>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    #[must_use]
    pub fn new() -> Self {
        let (counter, _) = tokio::sync::watch::channel(0);
        Self {
            counter: std::sync::Arc::new(counter),
        }
    }

    pub fn add(&self, value: usize) {
        self.counter.send_modify(|count| *count += value);
    }

    /// Marks one unit of work as finished.
    ///
    /// # Panics
    ///
    /// Panics if called more times than the total passed to [`WaitGroup::add`].
    pub fn done(&self) {
        let mut underflow = false;
        self.counter.send_modify(|count| match count.checked_sub(1) {
            Some(remaining) => *count = remaining,
            None => underflow = true,
        });
        assert!(!underflow, "WaitGroup::done called more times than add");
    }

    #[must_use]
    pub fn count(&self) -> usize {
        *self.counter.borrow()
    }

    /// Suspends until the counter reaches zero. Returns immediately if nothing is outstanding.
    pub async fn wait(&self) {
        let mut rx = self.counter.subscribe();
        // the sender lives as long as `self` so the channel cannot close while we wait
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}
