//! Multi-producer work queue
//!
//! Intrusive linked FIFO with a stub node. Any thread may `push`; `try_pop`
//! is serialized through a try-acquire consumer flag so the owning scheduler
//! and stealing peers can all pop without ever blocking. Contention on the
//! consumer side, and a producer caught between its two push steps, both
//! surface as [`Pop::Retry`] rather than [`Pop::Empty`].
//!
//! Nodes are heap allocated and owned by the caller between a pop and the
//! next push, so a value can be carried from queue to queue without
//! reallocating.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Queue linkage carrying one value
pub struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    /// Empty node
    pub fn new() -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        })
    }

    /// Node already carrying `value`
    pub fn with(value: T) -> Box<Self> {
        let mut node = Self::new();
        node.value = Some(value);
        node
    }

    /// Store a value, returning the previous one
    #[inline]
    pub fn put(&mut self, value: T) -> Option<T> {
        self.value.replace(value)
    }

    /// Take the carried value
    #[inline]
    pub fn take(&mut self) -> Option<T> {
        self.value.take()
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// Result of [`WorkQueue::try_pop`]
pub enum Pop<T> {
    /// Dequeued node, now owned by the caller
    Node(Box<Node<T>>),
    /// Nothing queued
    Empty,
    /// Contention: try again
    Retry,
}

impl<T> Pop<T> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Pop::Empty)
    }

    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, Pop::Retry)
    }
}

impl<T> std::fmt::Debug for Pop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pop::Node(_) => f.write_str("Node"),
            Pop::Empty => f.write_str("Empty"),
            Pop::Retry => f.write_str("Retry"),
        }
    }
}

/// Multi-producer, try-lock multi-consumer FIFO
pub struct WorkQueue<T> {
    /// Producer end: most recently pushed node
    head: AtomicPtr<Node<T>>,
    /// Consumer end, only touched while `consuming` is held
    tail: UnsafeCell<*mut Node<T>>,
    stub: *mut Node<T>,
    consuming: AtomicBool,
    len: AtomicUsize,
}

// Safety: `tail` is only accessed under the `consuming` flag; nodes move
// between threads together with their values
unsafe impl<T: Send> Send for WorkQueue<T> {}
unsafe impl<T: Send> Sync for WorkQueue<T> {}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let stub = Box::into_raw(Node::new());
        Self {
            head: AtomicPtr::new(stub),
            tail: UnsafeCell::new(stub),
            stub,
            consuming: AtomicBool::new(false),
            len: AtomicUsize::new(0),
        }
    }

    /// Append a node. Wait-free for producers.
    pub fn push(&self, node: Box<Node<T>>) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.push_raw(Box::into_raw(node));
    }

    fn push_raw(&self, node: *mut Node<T>) {
        unsafe { (*node).next.store(ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.head.swap(node, Ordering::AcqRel);
        // Between the swap and this store the chain is broken; consumers
        // reaching `prev` see Retry
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Dequeue the oldest node without blocking
    pub fn try_pop(&self) -> Pop<T> {
        if self
            .consuming
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Pop::Retry;
        }
        let result = unsafe { self.pop_locked() };
        self.consuming.store(false, Ordering::Release);

        if let Pop::Node(_) = result {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        result
    }

    /// # Safety
    ///
    /// Caller holds the consumer flag.
    unsafe fn pop_locked(&self) -> Pop<T> {
        let tail_slot = &mut *self.tail.get();
        let mut tail = *tail_slot;
        let mut next = (*tail).next.load(Ordering::Acquire);

        if tail == self.stub {
            if next.is_null() {
                return if self.head.load(Ordering::Acquire) == self.stub {
                    Pop::Empty
                } else {
                    Pop::Retry
                };
            }
            *tail_slot = next;
            tail = next;
            next = (*next).next.load(Ordering::Acquire);
        }

        if !next.is_null() {
            *tail_slot = next;
            return Pop::Node(Box::from_raw(tail));
        }

        // `tail` is the last linked node; it can only be returned once the
        // stub is behind it
        if tail != self.head.load(Ordering::Acquire) {
            return Pop::Retry;
        }
        self.push_raw(self.stub);

        next = (*tail).next.load(Ordering::Acquire);
        if !next.is_null() {
            *tail_slot = next;
            return Pop::Node(Box::from_raw(tail));
        }
        Pop::Retry
    }

    /// Approximate number of queued nodes
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: no producer can be mid-insert
        loop {
            match self.try_pop() {
                Pop::Node(node) => drop(node),
                Pop::Empty | Pop::Retry => break,
            }
        }
        unsafe { drop(Box::from_raw(self.stub)) };
    }
}
