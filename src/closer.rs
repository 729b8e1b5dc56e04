use crate::error::{CoreError, Result};
use crate::registry::CoreRegistry;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The single thread that physically closes retired cores.
///
/// Closing one core at a time, while holding the pending-op marker for its
/// name, keeps a close from overlapping a reopen of the same name.
pub struct BackgroundCloser {
    thread_handle: Option<JoinHandle<()>>,
}

impl BackgroundCloser {
    pub fn start(registry: Arc<CoreRegistry>) -> Result<Self> {
        let thread_handle = thread::Builder::new()
            .name("core-closer".to_string())
            .spawn(move || Self::run_loop(registry))
            .map_err(|e| CoreError::Io(format!("failed to spawn core closer: {}", e)))?;
        tracing::debug!("[CLOSER] started");
        Ok(BackgroundCloser {
            thread_handle: Some(thread_handle),
        })
    }

    fn run_loop(registry: Arc<CoreRegistry>) {
        while !registry.is_shut_down() {
            registry.wait_for_work();
            while let Some(core) = registry.core_to_close() {
                let name = core.name();
                if core.ref_count() == 0 {
                    core.close_now();
                } else {
                    // The last release queues it again.
                    tracing::debug!("[CLOSER] {} still referenced, deferring", name);
                }
                drop(core);
                registry.remove_pending_op(&name);
                if registry.is_shut_down() {
                    break;
                }
            }
        }
        tracing::debug!("[CLOSER] stopped");
    }

    /// Wait up to `timeout` for the thread to exit. Returns false when it
    /// is still running; the thread is then left detached.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.thread_handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        if let Err(e) = handle.join() {
            tracing::warn!("[CLOSER] thread panicked: {:?}", e);
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CoreDescriptor;
    use crate::instance::test_support::NoopEngine;
    use crate::instance::Core;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn closes_queued_cores_and_clears_pending_marker() {
        let registry = CoreRegistry::new(usize::MAX);
        let mut closer = BackgroundCloser::start(Arc::clone(&registry)).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let core = Core::new(
            Arc::new(CoreDescriptor::new("a")),
            NoopEngine::counted(&closes),
        );
        registry.put("a", Arc::clone(&core), false);
        registry.remove("a", true);

        assert!(wait_for(|| core.is_closed()));
        assert!(wait_for(|| !registry.is_pending("a")));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        registry.begin_shutdown();
        assert!(closer.join_timeout(Duration::from_secs(5)));
        assert!(!closer.is_running());
    }

    #[test]
    fn held_core_closes_after_release() {
        let registry = CoreRegistry::new(usize::MAX);
        let mut closer = BackgroundCloser::start(Arc::clone(&registry)).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let core = Core::new(
            Arc::new(CoreDescriptor::new("a")),
            NoopEngine::counted(&closes),
        );
        registry.put("a", Arc::clone(&core), false);
        let held = registry.acquire("a").unwrap();
        registry.remove("a", true);

        thread::sleep(Duration::from_millis(50));
        assert!(!core.is_closed());
        drop(held);
        assert!(wait_for(|| core.is_closed()));

        registry.begin_shutdown();
        assert!(closer.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn join_timeout_on_stopped_closer_is_immediate() {
        let registry = CoreRegistry::new(usize::MAX);
        let mut closer = BackgroundCloser::start(Arc::clone(&registry)).unwrap();
        registry.begin_shutdown();
        assert!(closer.join_timeout(Duration::from_secs(5)));
        assert!(closer.join_timeout(Duration::from_millis(1)));
    }
}
