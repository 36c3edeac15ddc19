use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};

use crate::sink::SampleSink;

/// Single-producer / single-consumer ring of stereo u8 frames.
///
/// The producer side is a [`SampleSink`], so the machine can hand samples to
/// a host audio thread without taking the machine lock. The queue is lossy:
/// frames pushed while it is full are dropped and counted.
pub struct AudioProducer {
    inner: Arc<Inner>,
}

pub struct AudioConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    // One extra slot so head == tail is unambiguously empty.
    // Each slot packs a frame as (left << 8) | right.
    buf: Box<[AtomicU16]>,
    cap: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

impl Inner {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            (self.cap - tail) + head
        }
    }

    #[inline]
    fn next_index(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.cap { 0 } else { next }
    }
}

pub fn audio_queue(capacity_frames: usize) -> (AudioProducer, AudioConsumer) {
    let cap = capacity_frames.saturating_add(1).max(2);
    let buf = (0..cap).map(|_| AtomicU16::new(0x8080)).collect();

    let inner = Arc::new(Inner {
        buf,
        cap,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });

    (
        AudioProducer {
            inner: Arc::clone(&inner),
        },
        AudioConsumer { inner },
    )
}

impl AudioProducer {
    #[inline]
    pub fn push_stereo(&self, left: u8, right: u8) -> bool {
        let head = self.inner.head.load(Ordering::Relaxed);
        let next = self.inner.next_index(head);
        if next == self.inner.tail.load(Ordering::Acquire) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.inner.buf[head].store(((left as u16) << 8) | right as u16, Ordering::Relaxed);
        self.inner.head.store(next, Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity_frames(&self) -> usize {
        self.inner.cap - 1
    }

    /// Frames discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl SampleSink for AudioProducer {
    fn consume(&mut self, left: &[u8], right: &[u8]) {
        for (&l, &r) in left.iter().zip(right) {
            self.push_stereo(l, r);
        }
    }
}

impl AudioConsumer {
    #[inline]
    pub fn pop_stereo(&self) -> Option<(u8, u8)> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        if tail == self.inner.head.load(Ordering::Acquire) {
            return None;
        }
        let frame = self.inner.buf[tail].load(Ordering::Relaxed);
        self.inner
            .tail
            .store(self.inner.next_index(tail), Ordering::Release);
        Some(((frame >> 8) as u8, frame as u8))
    }

    /// Pop up to `out.len()` frames, padding the rest with silence.
    /// Returns how many real frames were written.
    pub fn fill(&self, out: &mut [(u8, u8)]) -> usize {
        let mut n = 0;
        for slot in out.iter_mut() {
            match self.pop_stereo() {
                Some(frame) => {
                    *slot = frame;
                    n += 1;
                }
                None => *slot = (0x80, 0x80),
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn full_queue_drops_newest() {
        let (mut tx, rx) = audio_queue(2);
        tx.consume(&[1, 2, 3], &[4, 5, 6]);
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.pop_stereo(), Some((1, 4)));
        assert_eq!(rx.pop_stereo(), Some((2, 5)));
        assert_eq!(rx.pop_stereo(), None);
    }

    #[test]
    fn frames_cross_threads_in_order() {
        let (tx, rx) = audio_queue(64);
        let producer = thread::spawn(move || {
            let mut sent = 0u32;
            while sent < 1000 {
                if tx.push_stereo(sent as u8, !(sent as u8)) {
                    sent += 1;
                } else {
                    thread::yield_now();
                }
            }
        });
        let mut got = 0u32;
        while got < 1000 {
            if let Some((l, r)) = rx.pop_stereo() {
                assert_eq!(l, got as u8);
                assert_eq!(r, !(got as u8));
                got += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
