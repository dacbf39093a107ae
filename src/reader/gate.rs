use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How long a read may yield to let a more-sequential neighbour overtake.
const DEFAULT_WINDOW: Duration = Duration::from_millis(2);

struct Inner {
    pending: BTreeSet<(u64, u64)>,
    next_ticket: u64,
}

/// Read-reorder gate.
///
/// Kernel reads can arrive slightly out of order, which tears down the
/// sequential prefetch stream. Each read registers its offset here and
/// briefly yields while a lower-offset read is pending, so near-simultaneous
/// requests re-sequence. The wait is bounded by a deadline and the pass is
/// released on drop, so cancellation cannot deadlock the gate.
pub struct ReadGate {
    inner: Mutex<Inner>,
    notify: Notify,
    window: Duration,
}

impl ReadGate {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        ReadGate {
            inner: Mutex::new(Inner {
                pending: BTreeSet::new(),
                next_ticket: 0,
            }),
            notify: Notify::new(),
            window,
        }
    }

    /// Registers a read at `offset` and waits until it is the most
    /// sequential pending read, or until the window expires. The returned
    /// pass must be held for the duration of the read.
    pub async fn wait(&self, offset: u64) -> GatePass<'_> {
        let ticket = {
            let mut inner = self.inner.lock();
            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            inner.pending.insert((offset, ticket));
            ticket
        };
        // Constructed before the wait so a cancelled caller still removes
        // its pending entry and wakes the others.
        let pass = GatePass {
            gate: self,
            offset,
            ticket,
        };

        let deadline = Instant::now() + self.window;
        loop {
            if !self.blocked(offset, ticket) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                break;
            }
        }

        pass
    }

    fn blocked(&self, offset: u64, ticket: u64) -> bool {
        let inner = self.inner.lock();
        match inner.pending.iter().next() {
            Some(&first) => first < (offset, ticket),
            None => false,
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Default for ReadGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GatePass<'a> {
    gate: &'a ReadGate,
    offset: u64,
    ticket: u64,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate
            .inner
            .lock()
            .pending
            .remove(&(self.offset, self.ticket));
        self.gate.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn lone_read_passes_immediately() {
        let gate = ReadGate::new();
        let pass = gate.wait(4096).await;
        assert_eq!(gate.pending_len(), 1);
        drop(pass);
        assert_eq!(gate.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_order_reads_are_resequenced() {
        let gate = Arc::new(ReadGate::with_window(Duration::from_millis(500)));
        let order = Arc::new(Mutex::new(Vec::new()));

        // While the read at offset 0 is in flight, 8192 arrives before 4096.
        // Both park at the gate; when 0 finishes, 4096 must overtake 8192.
        let low = gate.wait(0).await;

        let mut handles = Vec::new();
        for (delay_ms, offset) in [(0_u64, 8192_u64), (20, 4096)] {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _pass = gate.wait(offset).await;
                order.lock().push(offset);
            }));
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(order.lock().is_empty());
        drop(low);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![4096, 8192]);
        assert_eq!(gate.pending_len(), 0);
    }

    #[tokio::test]
    async fn window_expiry_unblocks_waiters() {
        let gate = ReadGate::with_window(Duration::from_millis(10));
        let _low = gate.wait(0).await;
        // A higher offset proceeds once its window expires even though the
        // lower pass is still held.
        let start = Instant::now();
        let _high = gate.wait(1 << 20).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
