//! Background Jobs
//!
//! Spawn-then-join worker threads. A job is started at a known point in the
//! frame and joined, blocking, at a later known point; its result or panic is
//! handed back to the joining thread.

use std::thread::{self, JoinHandle};

use crate::{VirtualTextureError, VtResult};

/// A named worker thread producing a single value
#[derive(Debug)]
pub struct BackgroundJob<T> {
    handle: Option<JoinHandle<T>>,
    name: String,
}

impl<T: Send + 'static> BackgroundJob<T> {
    /// Spawn a new named thread running `f`
    pub fn spawn<F>(name: impl Into<String>, f: F) -> VtResult<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(VirtualTextureError::JobSpawn)?;

        Ok(Self {
            handle: Some(handle),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the job has finished without blocking
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Block until the job completes and take its result
    pub fn join(mut self) -> VtResult<T> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| VirtualTextureError::JobPanicked(self.name.clone()))?;
        handle
            .join()
            .map_err(|_| VirtualTextureError::JobPanicked(self.name.clone()))
    }
}

impl<T> Drop for BackgroundJob<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Never leave a detached worker behind
            if handle.join().is_err() {
                log::warn!("Background job '{}' panicked before being joined", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_join_returns_result() {
        let job = BackgroundJob::spawn("sum", || (1..=100u32).sum::<u32>()).unwrap();
        assert_eq!(job.name(), "sum");
        assert_eq!(job.join().unwrap(), 5050);
    }

    #[test]
    fn test_thread_is_named() {
        let job = BackgroundJob::spawn("vt-dedup", || thread::current().name().map(str::to_owned)).unwrap();
        assert_eq!(job.join().unwrap().as_deref(), Some("vt-dedup"));
    }

    #[test]
    fn test_panic_becomes_error() {
        let job = BackgroundJob::spawn("doomed", || -> u32 { panic!("boom") }).unwrap();
        match job.join() {
            Err(VirtualTextureError::JobPanicked(name)) => assert_eq!(name, "doomed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_drop_waits_for_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let job = BackgroundJob::spawn("slow", move || {
            thread::sleep(std::time::Duration::from_millis(20));
            flag.store(true, Ordering::Release);
        })
        .unwrap();
        drop(job);
        assert!(done.load(Ordering::Acquire));
    }
}
