//! Cross-Loop Primitives
//!
//! Two building blocks cross thread boundaries in this framework:
//!
//! - [`spsc_queue`]: a bounded single-producer/single-consumer queue of
//!   owned values with an eventfd wakeup, so the consumer side can be
//!   drained by a read pump on its event loop instead of polling;
//! - [`ObjPool`]: a fixed-depth lock-free pool recycling small objects
//!   between any number of producers and consumers.
//!
//! Ownership moves with the value: once pushed, only the consumer side may
//! touch it, which is exactly what the `Send` bound checks.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::error::{Error, Result};

/// Eventfd-based wakeup shared by the two queue endpoints
pub(crate) struct WakeFd {
    fd: EventFd,
}

impl WakeFd {
    pub(crate) fn new() -> Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(|_| Error::External)?;
        Ok(Self { fd })
    }

    /// Post one wakeup; the consumer's poll sees the fd readable
    pub(crate) fn signal(&self) {
        let one = 1u64.to_ne_bytes();
        // A full counter still leaves the fd readable; losing the extra
        // increment is harmless.
        unsafe {
            libc::write(self.raw_fd(), one.as_ptr().cast(), one.len());
        }
    }

    /// Clear pending wakeups
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.raw_fd(), buf.as_mut_ptr().cast(), buf.len());
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}

/// Producer endpoint of a bounded SPSC queue
pub struct SpscProducer<T: Send> {
    ring: rtrb::Producer<T>,
    wake: Arc<WakeFd>,
}

/// Consumer endpoint of a bounded SPSC queue
pub struct SpscConsumer<T: Send> {
    ring: rtrb::Consumer<T>,
    wake: Arc<WakeFd>,
}

/// Create a bounded SPSC queue of `capacity` elements with an fd wakeup
pub fn spsc_queue<T: Send>(capacity: usize) -> Result<(SpscProducer<T>, SpscConsumer<T>)> {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    let wake = Arc::new(WakeFd::new()?);
    Ok((
        SpscProducer {
            ring: producer,
            wake: Arc::clone(&wake),
        },
        SpscConsumer {
            ring: consumer,
            wake,
        },
    ))
}

impl<T: Send> SpscProducer<T> {
    /// Push without blocking; hands the value back when the ring is full
    pub fn push(&mut self, value: T) -> std::result::Result<(), T> {
        match self.ring.push(value) {
            Ok(()) => {
                self.wake.signal();
                Ok(())
            }
            Err(rtrb::PushError::Full(value)) => Err(value),
        }
    }

    /// Free slots currently available
    pub fn slots(&self) -> usize {
        self.ring.slots()
    }
}

impl<T: Send> SpscConsumer<T> {
    /// Pop the next element, preserving producer order
    pub fn pop(&mut self) -> Option<T> {
        self.ring.pop().ok()
    }

    /// Clear the wakeup; call from the read pump before draining
    pub fn acknowledge(&self) {
        self.wake.drain();
    }

    /// The fd to register a read pump on
    pub fn wake_fd(&self) -> RawFd {
        self.wake.raw_fd()
    }
}

/// Fixed-depth lock-free pool for recycling small objects
///
/// `pop` and `push` never block: an empty pool simply misses (callers fall
/// back to the heap) and a full pool refuses the object (callers let it
/// drop).
pub struct ObjPool<T> {
    queue: ArrayQueue<T>,
}

impl<T> ObjPool<T> {
    /// Create a pool holding up to `depth` objects
    pub fn new(depth: usize) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
        }
    }

    /// Take a recycled object if one is available
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Return an object to the pool; hands it back when full
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        self.queue.push(value)
    }

    /// Objects currently pooled
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_order_and_bounds() {
        let (mut tx, mut rx) = spsc_queue::<u32>(4).unwrap();
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(99).unwrap_err(), 99);
        for i in 0..4 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn queue_crosses_threads() {
        let (mut tx, mut rx) = spsc_queue::<Vec<u8>>(128).unwrap();
        let producer = std::thread::spawn(move || {
            for i in 0u8..100 {
                let mut v = vec![i];
                loop {
                    match tx.push(v) {
                        Ok(()) => break,
                        Err(back) => {
                            v = back;
                            std::thread::yield_now();
                        }
                    }
                }
            }
        });
        let mut got = Vec::new();
        while got.len() < 100 {
            match rx.pop() {
                Some(v) => got.push(v[0]),
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(got, (0u8..100).collect::<Vec<_>>());
    }

    #[test]
    fn wakeup_fd_becomes_readable() {
        let (mut tx, rx) = spsc_queue::<u8>(4).unwrap();
        tx.push(1).unwrap();
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(rx.wake_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(buf), 1);
    }

    #[test]
    fn pool_misses_and_refuses() {
        let pool = ObjPool::new(2);
        assert!(pool.pop().is_none());
        pool.push(1).unwrap();
        pool.push(2).unwrap();
        assert_eq!(pool.push(3).unwrap_err(), 3);
        assert!(pool.pop().is_some());
    }
}
