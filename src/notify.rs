// SPDX-License-Identifier: GPL-3.0-only

//! New-frame notification between the producer and its consumer
//!
//! The producer fires a [`FrameNotifier`] after every publish. Consumers block
//! on the matching [`FrameWaiter`]; a wait that times out means the producer is
//! presumed dead.
//!
//! Two transports exist:
//! - a POSIX signal sent to a consumer process ([`SignalNotifier`] /
//!   [`SignalWaiter`]), which is what out-of-process readers register at open
//! - an in-process channel ([`ChannelNotifier`] / [`ChannelWaiter`]), used by
//!   tests and embedders

use crate::errors::{ServiceError, ServiceResult};
use std::io;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, warn};

/// Who to wake after each published frame, chosen at device open.
#[derive(Debug, Clone, Default)]
pub enum NotifyTarget {
    /// Publish silently; readers poll
    #[default]
    None,
    /// Send `signal` to process `pid`
    Signal { pid: i32, signal: i32 },
    /// Send the frame sequence over an in-process channel
    Channel(mpsc::Sender<u64>),
}

impl NotifyTarget {
    /// Create a channel target and the waiter that receives from it.
    pub fn channel() -> (Self, ChannelWaiter) {
        let (tx, rx) = mpsc::channel();
        (NotifyTarget::Channel(tx), ChannelWaiter { rx })
    }

    /// Validate the target and build its notifier.
    pub fn notifier(&self) -> ServiceResult<Option<Box<dyn FrameNotifier>>> {
        match self {
            NotifyTarget::None => Ok(None),
            NotifyTarget::Signal { pid, signal } => {
                Ok(Some(Box::new(SignalNotifier::new(*pid, *signal)?)))
            }
            NotifyTarget::Channel(tx) => Ok(Some(Box::new(ChannelNotifier { tx: tx.clone() }))),
        }
    }
}

/// Producer side: wake the consumer after a frame was published.
pub trait FrameNotifier: Send {
    fn notify(&self, sequence: u64) -> ServiceResult<()>;
}

/// Consumer side: block until the next notification.
pub trait FrameWaiter: Send {
    /// `Ok(true)` when notified, `Ok(false)` on timeout.
    fn wait(&mut self, timeout: Duration) -> ServiceResult<bool>;
}

/// Delivers a POSIX signal to the consumer process.
#[derive(Debug, Clone, Copy)]
pub struct SignalNotifier {
    pid: i32,
    signal: i32,
}

impl SignalNotifier {
    pub fn new(pid: i32, signal: i32) -> ServiceResult<Self> {
        if pid <= 0 {
            return Err(ServiceError::InvalidParameter(format!(
                "notification pid {} must be positive",
                pid
            )));
        }
        if signal <= 0 || signal > libc::SIGRTMAX() {
            return Err(ServiceError::InvalidParameter(format!(
                "signal {} out of range",
                signal
            )));
        }
        Ok(Self { pid, signal })
    }
}

impl FrameNotifier for SignalNotifier {
    fn notify(&self, sequence: u64) -> ServiceResult<()> {
        // SAFETY: kill only takes integers.
        let rc = unsafe { libc::kill(self.pid, self.signal) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            warn!(pid = self.pid, sequence, error = %err, "Frame notification failed");
            return Err(ServiceError::IoFailure(format!("kill({}): {}", self.pid, err)));
        }
        Ok(())
    }
}

/// Waits for a POSIX signal with `sigtimedwait`.
///
/// The constructor blocks the signal in the calling thread so it stays
/// pending instead of running its default action. Threads spawned afterwards
/// inherit the mask; threads spawned earlier must block it themselves or the
/// signal may terminate the process.
pub struct SignalWaiter {
    signal: i32,
    set: libc::sigset_t,
}

impl SignalWaiter {
    pub fn new(signal: i32) -> ServiceResult<Self> {
        // SAFETY: sigset_t is initialised by sigemptyset before use.
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            if libc::sigaddset(&mut set, signal) < 0 {
                return Err(ServiceError::InvalidParameter(format!(
                    "signal {} out of range",
                    signal
                )));
            }
        }
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(ServiceError::IoFailure(format!(
                "pthread_sigmask: {}",
                io::Error::from_raw_os_error(rc)
            )));
        }
        debug!(signal, "Blocked notification signal");
        Ok(Self { signal, set })
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }
}

impl FrameWaiter for SignalWaiter {
    fn wait(&mut self, timeout: Duration) -> ServiceResult<bool> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        loop {
            // SAFETY: set and ts are valid for the call; info may be null.
            let rc = unsafe { libc::sigtimedwait(&self.set, std::ptr::null_mut(), &ts) };
            if rc == self.signal {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(ServiceError::IoFailure(format!("sigtimedwait: {err}"))),
            }
        }
    }
}

/// Sends the frame sequence over an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<u64>,
}

impl FrameNotifier for ChannelNotifier {
    fn notify(&self, sequence: u64) -> ServiceResult<()> {
        // A consumer that went away is not the producer's problem.
        if self.tx.send(sequence).is_err() {
            debug!(sequence, "Notification receiver dropped");
        }
        Ok(())
    }
}

/// Receives sequences sent by a [`ChannelNotifier`].
#[derive(Debug)]
pub struct ChannelWaiter {
    rx: mpsc::Receiver<u64>,
}

impl ChannelWaiter {
    /// Drop queued notifications so the next wait blocks for a fresh frame.
    pub fn drain(&mut self) -> usize {
        self.rx.try_iter().count()
    }
}

impl FrameWaiter for ChannelWaiter {
    fn wait(&mut self, timeout: Duration) -> ServiceResult<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(_) => Ok(true),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(false),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(false),
        }
    }
}

/// Wakes on a fixed period; for readers without a notification target.
#[derive(Debug, Clone, Copy)]
pub struct IntervalWaiter {
    period: Duration,
}

impl IntervalWaiter {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl FrameWaiter for IntervalWaiter {
    fn wait(&mut self, timeout: Duration) -> ServiceResult<bool> {
        std::thread::sleep(self.period.min(timeout));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_roundtrip() {
        let (target, mut waiter) = NotifyTarget::channel();
        let notifier = target.notifier().unwrap().unwrap();
        notifier.notify(7).unwrap();
        assert!(waiter.wait(Duration::from_millis(100)).unwrap());
        assert!(!waiter.wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_channel_waiter_times_out_when_producer_gone() {
        let (target, mut waiter) = NotifyTarget::channel();
        drop(target);
        assert!(!waiter.wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_signal_target_validation() {
        assert!(matches!(
            SignalNotifier::new(0, libc::SIGUSR1),
            Err(ServiceError::InvalidParameter(_))
        ));
        assert!(matches!(
            SignalNotifier::new(1, 0),
            Err(ServiceError::InvalidParameter(_))
        ));
        assert!(SignalNotifier::new(1, libc::SIGUSR1).is_ok());
    }

    #[test]
    fn test_realtime_signal_bounds() {
        assert!(SignalNotifier::new(1, libc::SIGRTMIN()).is_ok());
        assert!(SignalNotifier::new(1, libc::SIGRTMAX()).is_ok());
        assert!(matches!(
            SignalNotifier::new(1, libc::SIGRTMAX() + 1),
            Err(ServiceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_none_target_has_no_notifier() {
        assert!(NotifyTarget::None.notifier().unwrap().is_none());
    }

    #[test]
    fn test_signal_waiter_receives_thread_directed_signal() {
        let mut waiter = SignalWaiter::new(libc::SIGUSR2).unwrap();
        assert!(!waiter.wait(Duration::from_millis(10)).unwrap());

        // Thread-directed, so it stays pending on this (blocking) thread.
        unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGUSR2) };
        assert!(waiter.wait(Duration::from_millis(100)).unwrap());
    }
}
