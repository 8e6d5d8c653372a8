//! Ambient microphone feed.
//!
//! A [`MicrophoneStream`] is a shared FIFO of mono samples: the capture side
//! pushes, the signal graph's microphone input node drains. Acquisition goes
//! through a [`MicrophoneProvider`] so the permission prompt / device open
//! stays outside the engine.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::MicrophoneError;

/// At most this many seconds of unread input are buffered.
const MAX_BUFFERED_SECONDS: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct MicrophoneStream {
    sample_rate: f64,
    buffer: Arc<Mutex<VecDeque<f32>>>,
    active: Arc<AtomicBool>,
}

impl MicrophoneStream {
    pub fn new(sample_rate: f64) -> Self {
        MicrophoneStream {
            sample_rate,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Append captured samples. Ignored once the stream is released.
    pub fn push(&self, samples: &[f32]) {
        if !self.is_active() {
            return;
        }
        let cap = (self.sample_rate * MAX_BUFFERED_SECONDS) as usize;
        let mut buffer = self.buffer.lock();
        buffer.extend(samples.iter().copied());
        let overflow = buffer.len().saturating_sub(cap);
        buffer.drain(..overflow);
    }

    /// Fill `out` with the oldest buffered samples, padding with silence.
    pub fn read_into(&self, out: &mut [f32]) {
        let mut buffer = self.buffer.lock();
        for slot in out.iter_mut() {
            *slot = buffer.pop_front().unwrap_or(0.0);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Stop capture and drop anything buffered. All clones observe this.
    pub fn release(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.buffer.lock().clear();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether `other` is a clone of this stream.
    pub fn same_stream(&self, other: &MicrophoneStream) -> bool {
        Arc::ptr_eq(&self.active, &other.active)
    }
}

/// Something that can hand out a microphone stream, e.g. after asking the
/// user for permission.
pub trait MicrophoneProvider: Send + Sync + 'static {
    fn acquire(&self) -> impl Future<Output = Result<MicrophoneStream, MicrophoneError>> + Send;
}

/// Provider backed by a stream the host feeds itself, or by a fixed failure.
#[derive(Debug, Clone)]
pub struct FeedMicrophone {
    result: Result<MicrophoneStream, MicrophoneError>,
    acquisitions: Arc<std::sync::atomic::AtomicUsize>,
}

impl FeedMicrophone {
    pub fn new(stream: MicrophoneStream) -> Self {
        FeedMicrophone {
            result: Ok(stream),
            acquisitions: Arc::default(),
        }
    }

    pub fn failing(error: MicrophoneError) -> Self {
        FeedMicrophone {
            result: Err(error),
            acquisitions: Arc::default(),
        }
    }

    /// How many times `acquire` has been called.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl MicrophoneProvider for FeedMicrophone {
    fn acquire(&self) -> impl Future<Output = Result<MicrophoneStream, MicrophoneError>> + Send {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let result = self.result.clone();
        async move { result }
    }
}
