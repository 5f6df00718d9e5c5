//! Lock-free unbounded MPMC queue.
//!
//! Michael–Scott linked list with a permanent sentinel at the head:
//! - every mutation of shared state is a single-word CAS
//! - producers and consumers help a lagging `tail` forward instead of waiting
//! - popped sentinels are retired through `crossbeam-epoch`, so a node is only
//!   freed once no pinned thread can still be reading it

use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// Padding to prevent false sharing between `head` and `tail`.
#[repr(align(64))]
struct CachePadded<T>(T);

/// A list cell. The sentinel's `data` is always uninitialised: either it was
/// never written (initial sentinel) or it was moved out by the pop that turned
/// this node into the sentinel.
struct Node<T> {
    data: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            data: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }

    fn with(value: T) -> Self {
        Self {
            data: MaybeUninit::new(value),
            next: Atomic::null(),
        }
    }
}

/// Unbounded FIFO safe for any number of concurrent pushers and poppers.
///
/// Neither `push` nor `pop` ever blocks: each CAS loop either completes or
/// retries because some other operation made progress.
pub struct ConcurrentQueue<T> {
    /// Sentinel node; `head.next` is the oldest linked item.
    head: CachePadded<Atomic<Node<T>>>,
    /// Last node, or one behind it while a push is mid-flight.
    tail: CachePadded<Atomic<Node<T>>>,
    /// Approximate number of items, bumped before linking so it never underflows.
    len: CachePadded<AtomicUsize>,
}

// The queue hands each `T` to exactly one popper, so `T: Send` is enough.
unsafe impl<T: Send> Send for ConcurrentQueue<T> {}
unsafe impl<T: Send> Sync for ConcurrentQueue<T> {}

impl<T> ConcurrentQueue<T> {
    /// Create an empty queue holding only the sentinel.
    pub fn new() -> Self {
        let queue = Self {
            head: CachePadded(Atomic::null()),
            tail: CachePadded(Atomic::null()),
            len: CachePadded(AtomicUsize::new(0)),
        };

        // SAFETY: the queue is not shared yet, no other thread can observe it.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
            queue.head.0.store(sentinel, Ordering::Relaxed);
            queue.tail.0.store(sentinel, Ordering::Relaxed);
        }

        queue
    }

    /// Append `value` at the tail.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let new = Owned::new(Node::with(value)).into_shared(guard);
        self.len.0.fetch_add(1, Ordering::Relaxed);

        loop {
            let tail = self.tail.0.load(Ordering::Acquire, guard);
            // SAFETY: `tail` is never null and cannot be reclaimed while pinned.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if tail != self.tail.0.load(Ordering::Acquire, guard) {
                continue;
            }

            if !next.is_null() {
                // Another push linked a node but has not swung `tail` yet.
                let _ = self.tail.0.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                )
                .is_ok()
            {
                // Best effort: if this loses, the next operation finishes the advance.
                let _ = self.tail.0.compare_exchange(
                    tail,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                return;
            }
        }
    }

    /// Remove and return the oldest item, or `None` when nothing is linked.
    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        self.pop_with(guard)
    }

    fn pop_with(&self, guard: &Guard) -> Option<T> {
        loop {
            let head = self.head.0.load(Ordering::Acquire, guard);
            // SAFETY: the sentinel is never null and is protected by `guard`.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            let tail = self.tail.0.load(Ordering::Acquire, guard);

            if head != self.head.0.load(Ordering::Acquire, guard) {
                continue;
            }

            // SAFETY: a non-null `next` stays allocated while `guard` is held.
            let next_ref = match unsafe { next.as_ref() } {
                Some(node) => node,
                None => return None,
            };

            if head == tail {
                // `tail` lags behind a push that already linked `next`.
                let _ = self.tail.0.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            if self
                .head
                .0
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                self.len.0.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: winning the CAS makes us the only reader of `next.data`;
                // `next` is now the sentinel and nobody else touches its payload.
                // The old sentinel is unreachable for new readers and is freed
                // once every thread pinned before this point has unpinned.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(next_ref.data.assume_init_read());
                }
            }
        }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.0.load(Ordering::Relaxed)
    }

    /// True when no item is linked after the sentinel.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.0.load(Ordering::Acquire, guard);
        // SAFETY: the sentinel is never null and is protected by `guard`.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees no concurrent access remains.
        unsafe {
            let guard = epoch::unprotected();
            while self.pop_with(guard).is_some() {}

            let sentinel = self.head.0.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}
