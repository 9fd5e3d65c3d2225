use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use detbatch_core::{DetError, Result};

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Fixed-capacity pool of equally sized buffers ("slabs").
///
/// Every slab is allocated up front, so the memory held by in-flight work is
/// bounded by `capacity × slab_len` no matter how many inputs are queued.
/// Acquisition never blocks on a condition variable: callers poll with
/// [`SlabPool::try_acquire`] or back off with [`SlabPool::acquire_with_backoff`].
/// Exhaustion is handled by polling with a bounded sleep rather than by a
/// blocking allocator.
///
/// Every [`SlabLease`] holds an `Arc` to its pool, so a pool cannot be dropped
/// while a slab is still leased. A lease that is leaked (e.g. with
/// `mem::forget`) shows up as [`SlabPool::is_balanced`] returning `false`.
pub struct SlabPool<T: bytemuck::Pod = f32> {
    id: u64,
    slab_len: usize,
    capacity: usize,
    state: Mutex<SlabState<T>>,
    peak_leased: AtomicUsize,
    backoff_waits: AtomicU64,
}

struct SlabState<T> {
    /// FIFO of free slab indices.
    free: VecDeque<usize>,
    /// `Some` while the slab is free, `None` while it is leased out.
    slabs: Vec<Option<Box<[T]>>>,
}

impl<T: bytemuck::Pod> SlabPool<T> {
    /// Preallocate `capacity` zeroed slabs of `slab_len` elements each.
    pub fn new(slab_len: usize, capacity: usize) -> Result<Self> {
        if slab_len == 0 || capacity == 0 {
            return Err(DetError::InvalidInput(format!(
                "slab pool needs a non-zero slab length and capacity, got {slab_len} x {capacity}"
            )));
        }

        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let slabs = (0..capacity)
            .map(|_| Some(vec![T::zeroed(); slab_len].into_boxed_slice()))
            .collect();

        tracing::debug!(
            pool_id = id,
            slab_len,
            capacity,
            bytes = slab_len.saturating_mul(capacity).saturating_mul(std::mem::size_of::<T>()),
            "allocated slab pool"
        );

        Ok(Self {
            id,
            slab_len,
            capacity,
            state: Mutex::new(SlabState {
                free: (0..capacity).collect(),
                slabs,
            }),
            peak_leased: AtomicUsize::new(0),
            backoff_waits: AtomicU64::new(0),
        })
    }

    /// Pool identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Total number of slabs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of elements in each slab.
    pub fn slab_len(&self) -> usize {
        self.slab_len
    }

    /// Number of slabs currently available.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of slabs currently leased out.
    pub fn leased_count(&self) -> usize {
        self.capacity - self.free_count()
    }

    /// Highest number of slabs ever leased out at the same time.
    pub fn peak_leased(&self) -> usize {
        self.peak_leased.load(Ordering::Relaxed)
    }

    /// How many times [`SlabPool::acquire_with_backoff`] had to sleep.
    pub fn backoff_waits(&self) -> u64 {
        self.backoff_waits.load(Ordering::Relaxed)
    }

    /// Whether every slab is back in the free list.
    pub fn is_balanced(&self) -> bool {
        self.free_count() == self.capacity
    }

    /// Lease the oldest free slab, or `None` if the pool is exhausted.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlabLease<T>> {
        let (index, data) = {
            let mut state = self.state.lock();
            let index = state.free.pop_front()?;
            let data = state.slabs[index]
                .take()
                .unwrap_or_else(|| panic!("free slab {index} has no backing memory (pool {})", self.id));
            let leased = self.capacity - state.free.len();
            self.peak_leased.fetch_max(leased, Ordering::Relaxed);
            (index, data)
        };

        Some(SlabLease {
            pool: Arc::clone(self),
            index,
            data,
        })
    }

    /// Lease a slab, sleeping `interval` between attempts while the pool is
    /// exhausted.
    pub fn acquire_with_backoff(self: &Arc<Self>, interval: Duration) -> SlabLease<T> {
        loop {
            if let Some(lease) = self.try_acquire() {
                return lease;
            }
            self.backoff_waits.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(interval);
        }
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: SlabLease<T>) {
        debug_assert_eq!(lease.pool_id(), self.id, "lease returned to the wrong pool");
        drop(lease);
    }

    /// Put slab `index` back on the free list.
    ///
    /// # Panics
    /// If `index` is out of range or already free. Either means the pool's
    /// bookkeeping is corrupt.
    fn return_slab(&self, index: usize, data: Box<[T]>) {
        let mut state = self.state.lock();
        assert!(
            index < self.capacity,
            "slab index {index} out of range for pool {} (capacity {})",
            self.id,
            self.capacity
        );
        let slot = &mut state.slabs[index];
        assert!(
            slot.is_none(),
            "slab {index} released twice (pool {})",
            self.id
        );
        *slot = Some(data);
        state.free.push_back(index);
        assert!(state.free.len() <= self.capacity);
    }
}

impl<T: bytemuck::Pod> std::fmt::Debug for SlabPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabPool")
            .field("id", &self.id)
            .field("slab_len", &self.slab_len)
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

/// Exclusive, move-only handle to one slab of a [`SlabPool`].
///
/// Whoever holds the lease owns the slab's memory. Dropping the lease puts
/// the slab back on the pool's free list.
pub struct SlabLease<T: bytemuck::Pod = f32> {
    pool: Arc<SlabPool<T>>,
    index: usize,
    data: Box<[T]>,
}

impl<T: bytemuck::Pod> SlabLease<T> {
    /// Index of the leased slab within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity of the owning pool.
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: bytemuck::Pod> Deref for SlabLease<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T: bytemuck::Pod> DerefMut for SlabLease<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: bytemuck::Pod> Drop for SlabLease<T> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.return_slab(self.index, data);
    }
}

impl<T: bytemuck::Pod> std::fmt::Debug for SlabLease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabLease")
            .field("pool_id", &self.pool.id)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}
