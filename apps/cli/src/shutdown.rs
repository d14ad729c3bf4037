//! Ctrl+C 优雅退出

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// 退出标志（Ctrl+C 或时长到期）
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    /// 安装 Ctrl+C 处理器
    pub fn install() -> Result<Self> {
        let shutdown = Self::default();
        let handle = shutdown.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nReceived interrupt signal. Shutting down...");
            handle.request();
        })
        .context("Failed to set signal handler")?;
        Ok(shutdown)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// 睡眠至多 `duration`，收到退出请求时提前返回；返回是否已请求退出
    pub fn sleep(&self, duration: Duration) -> bool {
        const STEP: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(STEP.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_returns_early_on_request() {
        let shutdown = Shutdown::default();
        assert!(!shutdown.sleep(Duration::from_millis(10)));

        let remote = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.request();
        });
        let start = Instant::now();
        assert!(shutdown.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }
}
