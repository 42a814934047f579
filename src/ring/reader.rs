// SPDX-License-Identifier: GPL-3.0-only

//! Consumer-side loop over a ring channel
//!
//! A reader attaches by key, suspends on its notification source, and copies
//! out the latest frame on every wake-up. Missing a wake-up only means a frame
//! is skipped; the next read still returns the newest one.

use super::{ChannelMark, LatestFrame, SharedRingChannel};
use crate::errors::{ServiceError, ServiceResult};
use crate::notify::FrameWaiter;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one [`RingReader::next_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Frame(LatestFrame),
    /// Woken, but nothing has been published yet
    NotReady,
    /// The producer marked the channel terminated
    Terminated,
    /// No notification within the timeout; the producer is presumed dead
    ProducerGone,
}

/// Attached reader that waits for notifications and reads the latest frame.
pub struct RingReader {
    channel: SharedRingChannel,
    waiter: Box<dyn FrameWaiter>,
    timeout: Duration,
    frames_read: u64,
}

impl RingReader {
    pub fn attach(key: i32, waiter: Box<dyn FrameWaiter>, timeout: Duration) -> ServiceResult<Self> {
        Ok(Self {
            channel: SharedRingChannel::attach(key)?,
            waiter,
            timeout,
            frames_read: 0,
        })
    }

    pub fn channel(&self) -> &SharedRingChannel {
        &self.channel
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Wait for the next notification and read the newest frame.
    ///
    /// Corrupt slots are logged and reported as `NotReady` so a torn read
    /// never ends the reader.
    pub fn next_frame(&mut self) -> ServiceResult<ReaderEvent> {
        if !self.waiter.wait(self.timeout)? {
            debug!(key = self.channel.key(), "No notification within timeout");
            return Ok(ReaderEvent::ProducerGone);
        }

        if self.channel.mark()? == ChannelMark::Terminate {
            return Ok(ReaderEvent::Terminated);
        }

        match self.channel.read_latest() {
            Ok(frame) => {
                self.frames_read += 1;
                self.channel.set_read_index(frame.index as i32)?;
                Ok(ReaderEvent::Frame(frame))
            }
            Err(ServiceError::NotReady) => Ok(ReaderEvent::NotReady),
            Err(ServiceError::CorruptSlot { index, length }) => {
                warn!(index, length, "Skipping corrupt slot");
                Ok(ReaderEvent::NotReady)
            }
            Err(e) => Err(e),
        }
    }

    /// Detach from the channel.
    pub fn close(mut self) -> ServiceResult<()> {
        self.channel.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyTarget;

    #[test]
    fn test_reader_sees_latest_frame() {
        let mut producer = SharedRingChannel::create(32, 0, 3, 0).unwrap();
        let (target, waiter) = NotifyTarget::channel();
        let notifier = target.notifier().unwrap().unwrap();
        let mut reader =
            RingReader::attach(producer.key(), Box::new(waiter), Duration::from_millis(200))
                .unwrap();

        notifier.notify(0).unwrap();
        assert_eq!(reader.next_frame().unwrap(), ReaderEvent::NotReady);

        producer.write_copy(&[1; 8], None, None).unwrap();
        producer.write_copy(&[2; 8], None, None).unwrap();
        notifier.notify(1).unwrap();
        match reader.next_frame().unwrap() {
            ReaderEvent::Frame(frame) => {
                assert_eq!(frame.index, 1);
                assert_eq!(frame.data, vec![2; 8]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(reader.frames_read(), 1);
        assert_eq!(producer.read_index().unwrap(), 1);

        producer.set_mark(ChannelMark::Terminate).unwrap();
        notifier.notify(2).unwrap();
        assert_eq!(reader.next_frame().unwrap(), ReaderEvent::Terminated);
        reader.close().unwrap();
    }

    #[test]
    fn test_reader_reports_producer_gone() {
        let producer = SharedRingChannel::create(32, 0, 2, 0).unwrap();
        let (_target, waiter) = NotifyTarget::channel();
        let mut reader =
            RingReader::attach(producer.key(), Box::new(waiter), Duration::from_millis(20))
                .unwrap();
        assert_eq!(reader.next_frame().unwrap(), ReaderEvent::ProducerGone);
    }
}
