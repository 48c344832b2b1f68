//! 优雅关闭：进行中请求计数
//!
//! 每个被接收的请求持有一个 RequestGuard，直到回答写入会话库后才释放。
//! 关闭时先 drain：拒绝新请求，等待计数归零（或超时），再调用 StateManager::shutdown。

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Counter {
    in_flight: usize,
    draining: bool,
}

/// 进行中请求计数器
#[derive(Debug, Default)]
pub struct RequestTracker {
    counter: Mutex<Counter>,
    idle: Condvar,
}

/// 单个请求的登记凭证；Drop 时计数减一
#[derive(Debug)]
pub struct RequestGuard {
    tracker: Arc<RequestTracker>,
}

impl RequestTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self) -> MutexGuard<'_, Counter> {
        self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记一个请求；已开始 drain 时返回 None
    pub fn begin(self: &Arc<Self>) -> Option<RequestGuard> {
        let mut counter = self.counter();
        if counter.draining {
            return None;
        }
        counter.in_flight += 1;
        Some(RequestGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.counter().in_flight
    }

    pub fn is_draining(&self) -> bool {
        self.counter().draining
    }

    /// 拒绝新请求并等待进行中请求全部结束；超时返回 false
    pub fn drain(&self, timeout: Duration) -> bool {
        let mut counter = self.counter();
        counter.draining = true;
        if counter.in_flight > 0 {
            tracing::info!(in_flight = counter.in_flight, "waiting for in-flight requests");
        }
        let (counter, result) = self
            .idle
            .wait_timeout_while(counter, timeout, |c| c.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            tracing::warn!(in_flight = counter.in_flight, "drain timed out");
            return false;
        }
        true
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let mut counter = self.tracker.counter();
        counter.in_flight = counter.in_flight.saturating_sub(1);
        if counter.in_flight == 0 {
            self.tracker.idle.notify_all();
        }
    }
}
