use tokio::sync::{Mutex, MutexGuard};

/// Coordinates exclusive access to the browser's single foreground tab.
///
/// The browser renders exactly one tab in the foreground, and screenshots
/// require `Page.bringToFront`, so the capture sequence of one worker must
/// never interleave with another worker's capture or with tab creation.
/// Three mutexes implement a fair handoff:
///
/// - `m` guards the foreground state itself (the critical section).
/// - `n` is the "I am next" baton: a waiter locks `n`, locks `m`, then
///   releases `n`, so at most one party races for `m` at a time and the
///   handoff stays ordered.
/// - `l` serializes screenshotting workers against each other, so a worker
///   that started waiting earlier enters the capture section first.
///
/// Tab creation takes only the inner `n`/`m` pair; screenshotting takes `l`
/// around it. Both paths rely on tokio mutexes waking waiters in FIFO
/// order. The arbiter is an explicit value shared via `Arc`; there are no
/// process globals.
#[derive(Debug, Default)]
pub struct ViewportArbiter {
    l: Mutex<()>,
    m: Mutex<()>,
    n: Mutex<()>,
}

/// Holds the foreground for a screenshot sequence; released on drop.
#[derive(Debug)]
pub struct ScreenshotTurn<'a> {
    _outer: MutexGuard<'a, ()>,
    _foreground: MutexGuard<'a, ()>,
}

/// Holds the foreground for a tab creation; released on drop.
#[derive(Debug)]
pub struct TabTurn<'a> {
    _foreground: MutexGuard<'a, ()>,
}

impl ViewportArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for an exclusive screenshot turn.
    ///
    /// Acquires `l`, then runs the `n`→`m`→release-`n` handshake. The
    /// returned guard holds `l` and `m` until dropped.
    pub async fn screenshot_turn(&self) -> ScreenshotTurn<'_> {
        let outer = self.l.lock().await;
        let baton = self.n.lock().await;
        let foreground = self.m.lock().await;
        drop(baton);
        ScreenshotTurn {
            _outer: outer,
            _foreground: foreground,
        }
    }

    /// Wait for an exclusive tab-creation turn.
    ///
    /// Runs the same `n`→`m`→release-`n` handshake without the outer lock,
    /// so tab creation queues fairly against screenshotters but does not
    /// serialize behind every waiting screenshotter.
    pub async fn tab_turn(&self) -> TabTurn<'_> {
        let baton = self.n.lock().await;
        let foreground = self.m.lock().await;
        drop(baton);
        TabTurn {
            _foreground: foreground,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    /// Two screenshot turns never hold the foreground at the same time.
    #[tokio::test]
    async fn screenshot_turns_are_disjoint() {
        let arbiter = Arc::new(ViewportArbiter::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let arbiter = Arc::clone(&arbiter);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _turn = arbiter.screenshot_turn().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    /// Tab turns and screenshot turns exclude each other on `m`.
    #[tokio::test]
    async fn tab_turn_excludes_screenshot_turn() {
        let arbiter = Arc::new(ViewportArbiter::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..10 {
            let arbiter = Arc::clone(&arbiter);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let _turn = arbiter.tab_turn().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(3)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let _turn = arbiter.screenshot_turn().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(3)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    /// Screenshotters enter the critical section in the order they started
    /// waiting on the outer lock.
    #[tokio::test]
    async fn screenshot_turns_are_fifo() {
        let arbiter = Arc::new(ViewportArbiter::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Hold a turn so every spawned worker queues on `l`.
        let gate = arbiter.screenshot_turn().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let arbiter = Arc::clone(&arbiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _turn = arbiter.screenshot_turn().await;
                order.lock().unwrap().push(i);
            }));
            // let worker i start waiting before worker i+1 spawns
            sleep(Duration::from_millis(10)).await;
        }

        drop(gate);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
