//! Ring-buffered stage that moves decode and file I/O off the real-time path.
//!
//! A producer thread pulls the upstream into a single-producer
//! single-consumer ring until the high watermark is reached, then parks on a
//! condition variable. The consumer side (`read`) never blocks: it pops what
//! is there and wakes the producer once occupancy falls to the low watermark.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, trace};

use crate::{
    config::BufferConfig,
    stream::{AudioStream, BoxedStream, Sample},
    Result,
};

struct Shared {
    gate: Mutex<()>,
    refill: Condvar,
    stop: AtomicBool,
    exhausted: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill.notify_all();
    }
}

/// Buffered wrapper around a (possibly slow) upstream stage.
pub struct BufferedStream {
    config: BufferConfig,
    consumer: HeapCons<Sample>,
    /// Producer half and upstream, handed to the worker on `start`.
    pending: Option<(HeapProd<Sample>, BoxedStream)>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    underruns: u64,
}

impl BufferedStream {
    pub fn new(upstream: BoxedStream, config: &BufferConfig) -> Result<Self> {
        config.validate()?;

        let (producer, consumer) = HeapRb::<Sample>::new(config.capacity).split();
        Ok(Self {
            config: config.clone(),
            consumer,
            pending: Some((producer, upstream)),
            shared: Arc::new(Shared {
                gate: Mutex::new(()),
                refill: Condvar::new(),
                stop: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
            }),
            worker: None,
            underruns: 0,
        })
    }

    /// Samples currently buffered and ready for `read`.
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    /// True once the upstream ran dry. Buffered samples may still be pending.
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::Acquire)
    }

    /// Reads that came up short while the upstream was still producing.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.stop.store(true, Ordering::Release);
            self.shared.wake();
            if handle.join().is_err() {
                error!("buffer producer thread panicked");
            }
        }
    }
}

impl AudioStream for BufferedStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        let popped = self.consumer.pop_slice(buffer);

        if popped < buffer.len() && !self.is_exhausted() && self.worker.is_some() {
            self.underruns += 1;
            trace!(requested = buffer.len(), popped, "ring buffer underrun");
        }

        if self.consumer.occupied_len() <= self.config.low_watermark {
            self.shared.wake();
        }

        popped
    }

    fn start(&mut self) -> bool {
        let Some((producer, mut upstream)) = self.pending.take() else {
            debug!("buffered stream already started");
            return self.worker.is_some();
        };

        if !upstream.start() {
            error!("buffered stream upstream failed to start");
            return false;
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("buffer-producer".into())
            .spawn(move || produce(upstream, producer, shared, config));

        match spawned {
            Ok(handle) => {
                info!(
                    capacity = self.config.capacity,
                    low = self.config.low_watermark,
                    high = self.config.high_watermark,
                    "buffer producer started"
                );
                self.worker = Some(handle);
                true
            }
            Err(err) => {
                error!(%err, "failed to spawn buffer producer");
                false
            }
        }
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BufferedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedStream")
            .field("config", &self.config)
            .field("available", &self.available())
            .field("exhausted", &self.is_exhausted())
            .field("underruns", &self.underruns)
            .finish()
    }
}

fn produce(
    mut upstream: BoxedStream,
    mut producer: HeapProd<Sample>,
    shared: Arc<Shared>,
    config: BufferConfig,
) {
    let mut scratch = vec![0; config.chunk];

    while !shared.stop.load(Ordering::Acquire) {
        let occupied = producer.occupied_len();
        if occupied >= config.high_watermark {
            let gate = shared.gate.lock().unwrap_or_else(PoisonError::into_inner);
            let _gate = shared
                .refill
                .wait_while(gate, |_| {
                    !shared.stop.load(Ordering::Acquire)
                        && producer.occupied_len() > config.low_watermark
                })
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        let wanted = config.chunk.min(config.high_watermark - occupied);
        let produced = upstream.read(&mut scratch[..wanted]).min(wanted);
        // Only this thread pushes, so the space measured above is still free.
        let pushed = producer.push_slice(&scratch[..produced]);
        debug_assert_eq!(pushed, produced);

        if produced < wanted {
            shared.exhausted.store(true, Ordering::Release);
            debug!("buffer upstream exhausted");
            break;
        }
    }

    // `upstream` is released here, on the producer thread, before the owner's
    // join returns.
    drop(upstream);
}
