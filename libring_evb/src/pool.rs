//! Reusable storage for fragments.
//!
//! Fragment turnover dominates allocator traffic in a running pipeline, so
//! freed fragments park here instead of going back to the system allocator.
//! The pool is an ordinary owned object: each pipeline creates its own, and
//! independent pipelines (or tests) never share state.

use std::sync::Mutex;

use super::error::PoolError;
use super::fragment::{Fragment, FragmentHeader};

/// Smallest body size class, as a power-of-two exponent (32 bytes)
const MIN_CLASS_SHIFT: u32 = 5;
/// One free list per power-of-two class up to 2^31 bytes
const NUM_CLASSES: usize = (32 - MIN_CLASS_SHIFT) as usize;

/// Free-list index for a requested body size: the smallest power-of-two
/// class that holds it.
fn class_index(size: u32) -> usize {
    let class = size.max(1).next_power_of_two().max(1 << MIN_CLASS_SHIFT);
    (class.trailing_zeros() - MIN_CLASS_SHIFT) as usize
}

fn class_bytes(index: usize) -> usize {
    1usize << (index as u32 + MIN_CLASS_SHIFT)
}

struct PoolInner {
    shells: Vec<Box<Fragment>>,
    bodies: Vec<Vec<Vec<u8>>>,
}

/// Pools fragment shells and body buffers for reuse.
///
/// Both lists are LIFO: a freed fragment is pushed on the back and the next
/// allocation of the same class pops it. Lists only grow; the pool's high
/// water mark is the peak number of concurrently live fragments.
pub struct FragmentPool {
    inner: Mutex<PoolInner>,
}

impl Default for FragmentPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                shells: Vec::new(),
                bodies: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            }),
        }
    }

    /// Hand out a fragment whose body holds `header.size` bytes.
    ///
    /// The body buffer's capacity is the size class and may be larger than
    /// requested; callers must treat `header.size` as the logical length.
    /// Allocation failure is fatal and propagated, never retried.
    pub fn allocate(&self, header: FragmentHeader) -> Result<Box<Fragment>, PoolError> {
        let index = class_index(header.size);
        let mut inner = self.inner.lock().expect("fragment pool mutex poisoned");
        let mut body = match inner.bodies[index].pop() {
            Some(body) => body,
            None => {
                let mut fresh = Vec::new();
                fresh.try_reserve_exact(class_bytes(index))?;
                fresh
            }
        };
        body.resize(header.size as usize, 0);
        match inner.shells.pop() {
            Some(mut shell) => {
                shell.header = header;
                shell.body = body;
                Ok(shell)
            }
            None => Ok(Box::new(Fragment { header, body })),
        }
    }

    /// Return a fragment's shell and body storage to their free lists.
    ///
    /// The shell's body is detached first so a stale handle can never reach
    /// the recycled buffer.
    pub fn free(&self, mut fragment: Box<Fragment>) {
        let mut body = std::mem::take(&mut fragment.body);
        let index = class_index(fragment.header.size);
        body.clear();
        let mut inner = self.inner.lock().expect("fragment pool mutex poisoned");
        inner.bodies[index].push(body);
        inner.shells.push(fragment);
    }

    /// Number of parked shells, for tests and diagnostics
    pub fn idle_fragments(&self) -> usize {
        self.inner
            .lock()
            .expect("fragment pool mutex poisoned")
            .shells
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: u32) -> FragmentHeader {
        FragmentHeader::new(0, 0, size, 0)
    }

    #[test]
    fn test_class_index_boundaries() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(32), 0);
        assert_eq!(class_index(33), 1);
        assert_eq!(class_index(256), 3);
        assert_eq!(class_index(257), 4);
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = FragmentPool::new();
        let fragment = pool.allocate(header(100)).unwrap();
        let shell_ptr = &*fragment as *const Fragment;
        let body_ptr = fragment.body().as_ptr();
        pool.free(fragment);
        assert_eq!(pool.idle_fragments(), 1);

        let again = pool.allocate(header(100)).unwrap();
        assert_eq!(&*again as *const Fragment, shell_ptr);
        assert_eq!(again.body().as_ptr(), body_ptr);
        assert_eq!(pool.idle_fragments(), 0);
    }

    #[test]
    fn test_size_classes_never_alias() {
        let pool = FragmentPool::new();
        let small = pool.allocate(header(10)).unwrap();
        let small_body = small.body().as_ptr();
        pool.free(small);

        // 257 lands in a different class, so the parked small body must not
        // be handed out even though the shell is reused
        let large = pool.allocate(header(257)).unwrap();
        assert!(large.body.capacity() >= 257);
        assert_ne!(large.body().as_ptr(), small_body);

        let small_again = pool.allocate(header(10)).unwrap();
        assert_eq!(small_again.body().as_ptr(), small_body);
    }

    #[test]
    fn test_body_detached_on_free() {
        let pool = FragmentPool::new();
        let fragment = pool.allocate(header(64)).unwrap();
        pool.free(fragment);
        // Allocating from a different class reuses the shell with a new body
        let other = pool.allocate(header(1000)).unwrap();
        assert_eq!(other.body().len(), 1000);
        assert!(other.body().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_logical_length_tracks_header() {
        let pool = FragmentPool::new();
        let fragment = pool.allocate(header(40)).unwrap();
        assert_eq!(fragment.body().len(), 40);
        assert!(fragment.body.capacity() >= 64);
    }
}
