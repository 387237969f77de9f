//! Size-Bucketed Buffer Pool for Inbound Payloads
//!
//! ## Purpose
//!
//! Every payload read off the mesh or a client session lands in a buffer rented
//! from a [`BufferPool`]. Buffers are grouped in power-of-four size buckets so a
//! steady stream of similarly sized messages stops allocating after warm-up.
//!
//! ## Ownership Model
//!
//! ```text
//! socket read → pool.rent(n) → PooledBuffer ─move→ RoutePacket ─move→ stage
//!                                                        │
//!                                   drop (anywhere) ─────┘→ bucket free list
//! ```
//!
//! - A [`PooledBuffer`] has exactly one owner; handing it to a queue moves it.
//! - The buffer goes back to its bucket in `Drop`, so it is returned exactly
//!   once and can never be read afterwards.
//! - Requests larger than the biggest bucket get a plain allocation that is
//!   simply freed on drop.
//!
//! ## Exhaustion
//!
//! The pool never refuses a rental. When the number of outstanding rentals
//! crosses `leak_threshold` the pool logs at error level once per crossing;
//! in practice that means some component is holding packets it should have
//! dropped.

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Bucket capacities in bytes
const BUCKET_SIZES: [usize; 7] = [
    256,
    1024,
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
];

/// Pool sizing parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Free buffers retained per bucket; extras are released on return
    pub max_free_per_bucket: usize,
    /// Outstanding-rental count that triggers the exhaustion log
    pub leak_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free_per_bucket: 1024,
            leak_threshold: 100_000,
        }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub outstanding: usize,
    pub rented_total: u64,
    pub reused_total: u64,
    pub unpooled_total: u64,
}

static GLOBAL_POOL: Lazy<Arc<BufferPool>> = Lazy::new(|| BufferPool::new(PoolConfig::default()));

/// Size-bucketed pool of byte buffers
pub struct BufferPool {
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
    config: PoolConfig,
    outstanding: AtomicUsize,
    rented_total: AtomicU64,
    reused_total: AtomicU64,
    unpooled_total: AtomicU64,
    exhaustion_reported: AtomicBool,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            buckets: BUCKET_SIZES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            config,
            outstanding: AtomicUsize::new(0),
            rented_total: AtomicU64::new(0),
            reused_total: AtomicU64::new(0),
            unpooled_total: AtomicU64::new(0),
            exhaustion_reported: AtomicBool::new(false),
        })
    }

    /// Process-wide pool used by the transports
    pub fn global() -> Arc<BufferPool> {
        Arc::clone(&GLOBAL_POOL)
    }

    /// Rent a zero-filled buffer of exactly `len` bytes
    pub fn rent(self: &Arc<Self>, len: usize) -> PooledBuffer {
        self.rented_total.fetch_add(1, Ordering::Relaxed);
        let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.check_exhaustion(outstanding);

        let bucket = bucket_for(len);
        let mut buf = match bucket {
            Some(index) => match self.buckets[index].lock().pop() {
                Some(reused) => {
                    self.reused_total.fetch_add(1, Ordering::Relaxed);
                    reused
                }
                None => Vec::with_capacity(BUCKET_SIZES[index]),
            },
            None => {
                self.unpooled_total.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(len)
            }
        };
        buf.clear();
        buf.resize(len, 0);

        PooledBuffer {
            buf,
            bucket,
            pool: Arc::clone(self),
        }
    }

    /// Rent a buffer and fill it with a copy of `data`
    pub fn rent_copy(self: &Arc<Self>, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.rent(data.len());
        buffer.as_mut_slice().copy_from_slice(data);
        buffer
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.outstanding(),
            rented_total: self.rented_total.load(Ordering::Relaxed),
            reused_total: self.reused_total.load(Ordering::Relaxed),
            unpooled_total: self.unpooled_total.load(Ordering::Relaxed),
        }
    }

    /// Free buffers currently parked in the bucket that serves `len`
    pub fn free_count_for(&self, len: usize) -> usize {
        bucket_for(len)
            .map(|index| self.buckets[index].lock().len())
            .unwrap_or(0)
    }

    fn give_back(&self, bucket: Option<usize>, buf: Vec<u8>) {
        let outstanding = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        if outstanding < self.config.leak_threshold / 2
            && self.exhaustion_reported.swap(false, Ordering::AcqRel)
        {
            info!(outstanding, "Buffer pool recovered below leak threshold");
        }

        if let Some(index) = bucket {
            let mut free = self.buckets[index].lock();
            if free.len() < self.config.max_free_per_bucket {
                free.push(buf);
            }
        }
    }

    fn check_exhaustion(&self, outstanding: usize) {
        if outstanding >= self.config.leak_threshold
            && !self.exhaustion_reported.swap(true, Ordering::AcqRel)
        {
            error!(
                outstanding,
                threshold = self.config.leak_threshold,
                "Buffer pool exhaustion: outstanding rentals over threshold, packets are probably being leaked"
            );
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn bucket_for(len: usize) -> Option<usize> {
    BUCKET_SIZES.iter().position(|&size| len <= size)
}

/// Byte buffer rented from a [`BufferPool`], returned on drop
pub struct PooledBuffer {
    buf: Vec<u8>,
    bucket: Option<usize>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Shrink the logical length; capacity stays with the bucket
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(self.bucket, buf);
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Message payload: either a pooled inbound buffer or shared outbound bytes
#[derive(Default)]
pub enum Payload {
    #[default]
    Empty,
    Pooled(PooledBuffer),
    Shared(Bytes),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Pooled(buffer) => buffer.as_slice(),
            Payload::Shared(bytes) => bytes.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared copy of the payload; pooled buffers are copied out, shared bytes are
    /// reference counted.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Empty => Bytes::new(),
            Payload::Pooled(buffer) => Bytes::copy_from_slice(buffer.as_slice()),
            Payload::Shared(bytes) => bytes.clone(),
        }
    }
}

impl Clone for Payload {
    /// Cloning a pooled payload detaches it from the pool
    fn clone(&self) -> Self {
        match self {
            Payload::Empty => Payload::Empty,
            other => Payload::Shared(other.to_bytes()),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        if value.is_empty() {
            Payload::Empty
        } else {
            Payload::Shared(Bytes::from(value))
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        if value.is_empty() {
            Payload::Empty
        } else {
            Payload::Shared(value)
        }
    }
}

impl From<&'static [u8]> for Payload {
    fn from(value: &'static [u8]) -> Self {
        Bytes::from_static(value).into()
    }
}

impl From<PooledBuffer> for Payload {
    fn from(value: PooledBuffer) -> Self {
        Payload::Pooled(value)
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Payload::Empty"),
            Payload::Pooled(buffer) => write!(f, "Payload::Pooled({} bytes)", buffer.len()),
            Payload::Shared(bytes) => write!(f, "Payload::Shared({} bytes)", bytes.len()),
        }
    }
}
