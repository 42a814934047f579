// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for capture loops
//!
//! A capture session runs on its own thread and is driven one step at a
//! time. The loop's state moves into the thread and comes back out when the
//! thread stops, so the owner can tear it down on its own thread.

use crate::errors::{ServiceError, ServiceResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Returned by each loop step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// Controller for a capture loop running in a separate thread
///
/// ```ignore
/// let mut controller =
///     CaptureLoopController::start_with_state("preview", session, CaptureSession::step)?;
///
/// // Later, stop the loop and take the session back
/// if let Some(mut session) = controller.stop() {
///     session.shutdown()?;
/// }
/// ```
pub struct CaptureLoopController<S> {
    thread_handle: Option<JoinHandle<S>>,
    stop_requested: Arc<AtomicBool>,
    name: String,
}

impl<S: Send + 'static> CaptureLoopController<S> {
    /// Spawn a thread named `camera-<name>` that calls `step` on `state`
    /// until it returns [`LoopAction::Stop`] or [`stop`](Self::stop) is called.
    pub fn start_with_state<F>(name: &str, state: S, mut step: F) -> ServiceResult<Self>
    where
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
    {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_requested);
        let loop_name = name.to_string();

        let thread_handle = thread::Builder::new()
            .name(format!("camera-{name}"))
            .spawn(move || {
                let mut state = state;
                let mut iterations: u64 = 0;
                while !stop.load(Ordering::Acquire) {
                    iterations += 1;
                    if step(&mut state) == LoopAction::Stop {
                        debug!(name = %loop_name, "Loop requested stop");
                        break;
                    }
                }
                info!(name = %loop_name, iterations, "Capture loop thread exiting");
                state
            })
            .map_err(|e| {
                ServiceError::ResourceExhausted(format!("spawn {name} thread: {e}"))
            })?;

        info!(name = %name, "Started capture loop");
        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_requested,
            name: name.to_string(),
        })
    }

    /// Whether the thread is still stepping
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Ask the loop to stop after its current step, without waiting
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Stop the loop, wait for the thread, and take back its state
    pub fn stop(&mut self) -> Option<S> {
        self.request_stop();
        self.join()
    }

    /// Wait for the thread to finish on its own.
    ///
    /// `None` once already joined, or when the thread panicked (the state is
    /// lost with the panicking thread).
    pub fn join(&mut self) -> Option<S> {
        let handle = self.thread_handle.take()?;
        match handle.join() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(name = %self.name, "Capture loop thread panicked: {:?}", e);
                None
            }
        }
    }
}

impl<S> Drop for CaptureLoopController<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Controller dropped, stopping loop");
            self.stop_requested.store(true, Ordering::Release);
            if handle.join().is_err() {
                warn!(name = %self.name, "Capture loop thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_loop_stops_itself() {
        let mut controller = CaptureLoopController::start_with_state("count", 0u32, |n| {
            *n += 1;
            if *n > 10 {
                LoopAction::Stop
            } else {
                LoopAction::Continue
            }
        })
        .unwrap();

        assert_eq!(controller.join(), Some(11));
        assert!(!controller.is_running());
    }

    #[test]
    fn test_state_returned_on_stop() {
        let mut controller =
            CaptureLoopController::start_with_state("collect", Vec::<u32>::new(), |v| {
                v.push(v.len() as u32);
                thread::sleep(Duration::from_millis(1));
                LoopAction::Continue
            })
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(controller.is_running());
        let state = controller.stop().unwrap();
        assert!(!state.is_empty());
        assert_eq!(state[0], 0);
        assert!(controller.join().is_none());
    }

    #[test]
    fn test_thread_is_named() {
        let mut controller = CaptureLoopController::start_with_state("named", None, |name| {
            *name = thread::current().name().map(str::to_string);
            LoopAction::Stop
        })
        .unwrap();

        assert_eq!(controller.join(), Some(Some("camera-named".to_string())));
    }

    #[test]
    fn test_panicking_step_loses_state() {
        let mut controller =
            CaptureLoopController::start_with_state("panics", (), |_| panic!("step failed"))
                .unwrap();
        assert!(controller.join().is_none());
    }

    #[test]
    fn test_drop_stops_loop() {
        let controller = CaptureLoopController::start_with_state("dropped", (), |_| {
            thread::sleep(Duration::from_millis(5));
            LoopAction::Continue
        })
        .unwrap();
        drop(controller);
    }
}
