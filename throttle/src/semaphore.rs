use std::sync::atomic::{AtomicBool, Ordering};

pub struct Semaphore {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        let flag = AtomicBool::new(false);
        let sem = tokio::sync::Semaphore::const_new(tokio::sync::Semaphore::MAX_PERMITS);
        Self { flag, sem }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if self.flag.load(Ordering::Acquire) {
            // the semaphore is never closed, acquire can only fail after close()
            self.sem.acquire().await.ok()
        } else {
            None
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
