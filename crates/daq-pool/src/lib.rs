//! Reusable-object pool and aligned allocation for the frame pipeline.
//!
//! This crate provides the two memory primitives the acquisition pipeline is
//! built on:
//!
//! - [`AllocatorType`] / [`AlignedBuf`]: zeroed buffers on 16, 32 or 4096
//!   byte boundaries (see [`aligned`]).
//! - [`Pool<T>`]: a lock-protected free list of pre-built objects handed out
//!   as [`Loaned<T>`] guards that return themselves on drop.
//!
//! # Generations
//!
//! Every [`Pool::setup`] call starts a new generation. Items loaned out under
//! an older generation are discarded instead of re-entering the free list
//! when they come back, so the pool never hands out an object built for a
//! previous configuration.
//!
//! # Example
//!
//! ```
//! use daq_pool::Pool;
//!
//! let pool = Pool::new_with_reset(|| Some(vec![0u8; 1024]), |buf: &mut Vec<u8>| buf.fill(0));
//! assert!(pool.ensure_ready(4));
//!
//! let mut buf = pool.take().unwrap();
//! buf[0] = 42;
//! assert_eq!(pool.size(), 3);
//!
//! drop(buf); // back in the free list, reset to zero
//! assert_eq!(pool.size(), 4);
//! ```

pub mod aligned;

pub use aligned::{aligned_size, AlignedBuf, AllocError, AllocatorType, PAGE_SIZE};

use parking_lot::Mutex;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Factory used to build new pool items. `None` signals allocation failure.
type FactoryFn<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// Reset applied to an item when it returns to the pool.
type ResetFn<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

struct State<T> {
    free: Vec<T>,
    generation: u64,
    factory: Option<FactoryFn<T>>,
    reset: Option<ResetFn<T>>,
    outstanding: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn release(&self, mut item: T, generation: u64) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if generation != state.generation {
            // Built for an older setup; dropped outside the lock below.
            drop(state);
            drop(item);
            return;
        }
        if let Some(reset) = &state.reset {
            reset(&mut item);
        }
        state.free.push(item);
    }
}

/// Lock-protected free list of reusable objects.
///
/// Cloning a `Pool` yields another handle to the same free list.
pub struct Pool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create an empty, unconfigured pool. [`Pool::ensure_ready`] fails until
    /// [`Pool::setup`] installs a factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    free: Vec::new(),
                    generation: 0,
                    factory: None,
                    reset: None,
                    outstanding: 0,
                }),
            }),
        }
    }

    /// Create a pool with a factory and no reset function.
    #[must_use]
    pub fn new_simple<F>(factory: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        let pool = Self::new();
        pool.setup(factory, None::<fn(&mut T)>);
        pool
    }

    /// Create a pool with a factory and a reset function.
    #[must_use]
    pub fn new_with_reset<F, R>(factory: F, reset: R) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let pool = Self::new();
        pool.setup(factory, Some(reset));
        pool
    }

    /// Reinitialise the pool: install a new factory, discard every free item
    /// and start a new generation.
    pub fn setup<F, R>(&self, factory: F, reset: Option<R>)
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.factory = Some(Arc::new(factory));
            state.reset = reset.map(|r| Arc::new(r) as ResetFn<T>);
            std::mem::take(&mut state.free)
        };
        debug!(
            pool_type = std::any::type_name::<T>(),
            discarded = discarded.len(),
            "Pool reconfigured"
        );
    }

    /// Top the free list up to at least `target` items.
    ///
    /// Items are built outside the lock so concurrent [`Pool::take`] callers
    /// are never stalled behind an allocation. Returns `false` if the pool is
    /// unconfigured or the factory failed.
    pub fn ensure_ready(&self, target: usize) -> bool {
        let (missing, factory, generation) = {
            let state = self.shared.state.lock();
            let Some(factory) = state.factory.clone() else {
                return false;
            };
            (
                target.saturating_sub(state.free.len()),
                factory,
                state.generation,
            )
        };
        if missing == 0 {
            return true;
        }

        let mut built = Vec::with_capacity(missing);
        let mut ok = true;
        for _ in 0..missing {
            match factory() {
                Some(item) => built.push(item),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            warn!(
                pool_type = std::any::type_name::<T>(),
                requested = missing,
                built = built.len(),
                "Pool factory failed"
            );
        }

        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.free.extend(built);
        }
        ok && state.free.len() >= target
    }

    /// Drop free items until at most `target` remain. Returns how many were
    /// discarded.
    pub fn shrink_to(&self, target: usize) -> usize {
        let surplus: Vec<T> = {
            let mut state = self.shared.state.lock();
            if state.free.len() <= target {
                return 0;
            }
            state.free.split_off(target)
        };
        surplus.len()
    }

    /// Take one item, or `None` if the free list is empty. Never allocates.
    #[must_use]
    pub fn take(&self) -> Option<Loaned<T>> {
        let mut state = self.shared.state.lock();
        let item = state.free.pop()?;
        state.outstanding += 1;
        Some(Loaned {
            item: ManuallyDrop::new(item),
            generation: state.generation,
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Number of items currently in the free list.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Number of items loaned out under the current generation or older.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }
}

/// RAII guard for an item taken from a [`Pool`].
///
/// Returns the item to the pool's free list when dropped, unless the pool
/// has been reconfigured or dropped in the meantime.
pub struct Loaned<T: Send + 'static> {
    item: ManuallyDrop<T>,
    generation: u64,
    pool: Weak<Shared<T>>,
}

impl<T: Send + 'static> Loaned<T> {
    /// Generation of the pool setup this item was built for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T: Send + 'static> Deref for Loaned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Send + 'static> DerefMut for Loaned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Send + 'static> Drop for Loaned<T> {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        // SAFETY: drop runs once and the item is never touched afterwards.
        let item = unsafe { ManuallyDrop::take(&mut self.item) };
        if let Some(shared) = self.pool.upgrade() {
            shared.release(item, self.generation);
        }
    }
}
