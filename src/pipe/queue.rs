use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::error::{StoryError, StoryResult};
use crate::media::BufferInfo;
use crate::pipe::pool::{MediaBuffer, next_owner_id};

/// Default slot count for stage-internal queues.
pub const DEFAULT_QUEUE_SLOTS: usize = 4;

/// A bounded handoff of buffers between one producer and one consumer.
///
/// A fixed set of buffers circulates between an "empty" side (writable by
/// the producer) and a "filled" side (readable by the consumer); the slot
/// count is a hard capacity, so a producer blocks or times out instead of
/// growing the queue. FIFO ordering is preserved in both directions.
pub struct BufferQueue;

impl BufferQueue {
    /// Create a queue of `slots` buffers of `capacity` bytes each and split
    /// it into its two endpoints.
    pub fn with_slots(slots: usize, capacity: usize) -> (QueueProducer, QueueConsumer) {
        let owner = next_owner_id();
        let (empty_tx, empty_rx) = bounded(slots);
        let (filled_tx, filled_rx) = bounded(slots);
        for slot in 0..slots {
            empty_tx
                .send(MediaBuffer::new(owner, slot, capacity))
                .expect("seeding an empty bounded channel cannot fail");
        }
        (
            QueueProducer {
                owner,
                empty_rx,
                filled_tx,
            },
            QueueConsumer {
                owner,
                filled_rx,
                empty_tx,
            },
        )
    }
}

/// Producer endpoint: acquire writable buffers, hand back filled ones.
pub struct QueueProducer {
    owner: u64,
    empty_rx: Receiver<MediaBuffer>,
    filled_tx: Sender<(MediaBuffer, BufferInfo)>,
}

impl QueueProducer {
    /// Wait up to `timeout` for a writable buffer. `None` on timeout so the
    /// producer can recheck its shutdown flag; `None` also once the consumer
    /// endpoint is gone.
    pub fn get_empty_buffer(&self, timeout: Duration) -> Option<MediaBuffer> {
        match self.empty_rx.recv_timeout(timeout) {
            Ok(mut buffer) => {
                buffer.clear();
                Some(buffer)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Hand a filled buffer to the consumer side.
    pub fn send_filled_buffer(&self, buffer: MediaBuffer, info: BufferInfo) -> StoryResult<()> {
        if buffer.owner() != self.owner {
            return Err(StoryError::invalid_buffer(
                "buffer sent to a queue that does not own it",
            ));
        }
        match self.filled_tx.try_send((buffer, info)) {
            Ok(()) => Ok(()),
            // Capacity equals the circulating buffer count, so a full filled
            // side means a buffer entered from outside the queue.
            Err(TrySendError::Full(_)) => Err(StoryError::invalid_buffer(
                "filled side over capacity; buffer did not come from this queue",
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(StoryError::source_closed("queue consumer endpoint dropped"))
            }
        }
    }
}

/// Consumer endpoint: read filled buffers, recycle used ones.
pub struct QueueConsumer {
    owner: u64,
    filled_rx: Receiver<(MediaBuffer, BufferInfo)>,
    empty_tx: Sender<MediaBuffer>,
}

impl QueueConsumer {
    /// Block until a filled buffer is available, up to `timeout`.
    ///
    /// A disconnect after the buffered data drains means the producer exited
    /// without flagging end-of-stream; both that and a timeout surface as
    /// `SourceClosed`.
    pub fn get_filled_buffer(&self, timeout: Duration) -> StoryResult<(MediaBuffer, BufferInfo)> {
        match self.filled_rx.recv_timeout(timeout) {
            Ok(pair) => Ok(pair),
            Err(RecvTimeoutError::Timeout) => Err(StoryError::source_closed(
                "timed out waiting for a filled buffer",
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoryError::source_closed("queue producer endpoint dropped"))
            }
        }
    }

    /// Return a used buffer to the empty side.
    pub fn release_used_buffer(&self, buffer: MediaBuffer) -> StoryResult<()> {
        if buffer.owner() != self.owner {
            return Err(StoryError::invalid_buffer(
                "buffer released to a queue that does not own it",
            ));
        }
        match self.empty_tx.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(StoryError::invalid_buffer(
                "empty side over capacity; buffer did not come from this queue",
            )),
            // Producer gone while tearing down; dropping the buffer is fine.
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    /// True when no filled buffer is pending. Used to decide true
    /// end-of-stream only after buffered data is drained.
    pub fn is_empty(&self) -> bool {
        self.filled_rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferFlags;

    const CAP: usize = 64;

    #[test]
    fn producer_times_out_at_capacity() {
        let (producer, _consumer) = BufferQueue::with_slots(2, CAP);
        let a = producer.get_empty_buffer(Duration::from_millis(50)).unwrap();
        let b = producer.get_empty_buffer(Duration::from_millis(50)).unwrap();
        assert!(
            producer
                .get_empty_buffer(Duration::from_millis(20))
                .is_none()
        );
        producer.send_filled_buffer(a, BufferInfo::at(0)).unwrap();
        producer.send_filled_buffer(b, BufferInfo::at(1)).unwrap();
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (producer, consumer) = BufferQueue::with_slots(4, CAP);
        for pts in 0..4 {
            let mut buf = producer.get_empty_buffer(Duration::from_millis(50)).unwrap();
            buf.write_samples(&[pts as i16]).unwrap();
            producer
                .send_filled_buffer(buf, BufferInfo::at(pts))
                .unwrap();
        }
        for pts in 0..4 {
            let (buf, info) = consumer.get_filled_buffer(Duration::from_millis(50)).unwrap();
            assert_eq!(info.pts_us, pts);
            let mut samples = Vec::new();
            buf.read_samples_into(&mut samples);
            assert_eq!(samples, vec![pts as i16]);
            consumer.release_used_buffer(buf).unwrap();
        }
        assert!(consumer.is_empty());
    }

    #[test]
    fn released_buffers_become_writable_again() {
        let (producer, consumer) = BufferQueue::with_slots(1, CAP);
        for _ in 0..10 {
            let buf = producer.get_empty_buffer(Duration::from_millis(50)).unwrap();
            producer.send_filled_buffer(buf, BufferInfo::at(0)).unwrap();
            let (buf, _) = consumer.get_filled_buffer(Duration::from_millis(50)).unwrap();
            consumer.release_used_buffer(buf).unwrap();
        }
    }

    #[test]
    fn foreign_buffer_is_rejected_by_both_endpoints() {
        let (producer_a, _consumer_a) = BufferQueue::with_slots(1, CAP);
        let (producer_b, consumer_b) = BufferQueue::with_slots(1, CAP);
        let foreign = producer_a.get_empty_buffer(Duration::from_millis(50)).unwrap();
        let err = producer_b
            .send_filled_buffer(foreign, BufferInfo::at(0))
            .unwrap_err();
        assert!(err.to_string().contains("does not own"));

        let foreign = producer_b.get_empty_buffer(Duration::from_millis(50)).unwrap();
        // Route it through the queue so the consumer holds it legitimately,
        // then release to the wrong queue.
        producer_b
            .send_filled_buffer(foreign, BufferInfo::at(0))
            .unwrap();
        let (held, _) = consumer_b
            .get_filled_buffer(Duration::from_millis(50))
            .unwrap();
        let (_, consumer_c) = BufferQueue::with_slots(1, CAP);
        let err = consumer_c.release_used_buffer(held).unwrap_err();
        assert!(err.to_string().contains("does not own"));
    }

    #[test]
    fn consumer_sees_closed_after_producer_drops() {
        let (producer, consumer) = BufferQueue::with_slots(2, CAP);
        let mut buf = producer.get_empty_buffer(Duration::from_millis(50)).unwrap();
        buf.write_samples(&[7]).unwrap();
        let info = BufferInfo {
            pts_us: 0,
            flags: BufferFlags {
                end_of_stream: true,
                key_frame: false,
            },
        };
        producer.send_filled_buffer(buf, info).unwrap();
        drop(producer);

        // Buffered data still drains first.
        let (buf, info) = consumer.get_filled_buffer(Duration::from_millis(50)).unwrap();
        assert!(info.flags.end_of_stream);
        consumer.release_used_buffer(buf).unwrap();

        let err = consumer
            .get_filled_buffer(Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_source_closed());
    }
}
