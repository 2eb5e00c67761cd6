//! A lock-free, append-only directory from small integer indices to boxed values.
//!
//! The directory is a linked list of fixed-size nodes. A node is fully
//! initialized before it is published by a compare-and-swap on its
//! predecessor's `next` pointer, and nodes are never resized or unlinked, so a
//! reader walking the list never needs a lock and never observes a slot move.
//! Removing a value only nulls its slot; the slot may be reused by a later
//! insertion.

use std::marker::PhantomData;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

struct DirectoryNode<T> {
    slots: Box<[AtomicPtr<T>]>,
    next: AtomicPtr<DirectoryNode<T>>,
}

impl<T> DirectoryNode<T> {
    fn new(size: usize) -> Box<Self> {
        Box::new(DirectoryNode {
            slots: (0..size).map(|_| AtomicPtr::new(null_mut())).collect(),
            next: AtomicPtr::new(null_mut()),
        })
    }
}

pub struct Directory<T> {
    head: Box<DirectoryNode<T>>,
    node_size: usize,
    _marker: PhantomData<Box<T>>,
}

impl<T> Directory<T> {
    pub fn new(node_size: usize) -> Self {
        assert!(node_size > 0);
        Directory {
            head: DirectoryNode::new(node_size),
            node_size,
            _marker: PhantomData,
        }
    }

    fn nodes(&self) -> impl Iterator<Item = &DirectoryNode<T>> {
        let mut node: Option<&DirectoryNode<T>> = Some(&self.head);
        std::iter::from_fn(move || {
            let current = node?;
            let next = current.next.load(Ordering::Acquire);
            node = unsafe { next.as_ref() };
            Some(current)
        })
    }

    /// Store `value` in the first free slot, appending a node if every slot is
    /// taken. Returns the index of the slot.
    pub fn insert(&self, value: Box<T>) -> usize {
        self.insert_with_index(value, |_, _| {})
    }

    /// Like [`Directory::insert`], but `prepare` sees the value and the index
    /// of the slot it is about to be published in. A lost race on a slot calls
    /// `prepare` again with the next candidate. The last call names the slot.
    pub fn insert_with_index(&self, value: Box<T>, mut prepare: impl FnMut(&T, usize)) -> usize {
        let ptr = Box::into_raw(value);
        let mut base = 0;
        let mut node: &DirectoryNode<T> = &self.head;
        loop {
            for (i, slot) in node.slots.iter().enumerate() {
                if !slot.load(Ordering::Relaxed).is_null() {
                    continue;
                }
                // Not yet published, so this thread still owns the value.
                prepare(unsafe { &*ptr }, base + i);
                if slot
                    .compare_exchange(null_mut(), ptr, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return base + i;
                }
            }
            base += node.slots.len();

            let mut next = node.next.load(Ordering::Acquire);
            if next.is_null() {
                let fresh = Box::into_raw(DirectoryNode::new(self.node_size));
                match node.next.compare_exchange(
                    null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        trace!("Directory grew to {} slots", base + self.node_size);
                        next = fresh;
                    }
                    Err(existing) => {
                        // Somebody else appended first. Use theirs.
                        drop(unsafe { Box::from_raw(fresh) });
                        next = existing;
                    }
                }
            }
            node = unsafe { &*next };
        }
    }

    fn slot(&self, index: usize) -> Option<&AtomicPtr<T>> {
        let mut base = 0;
        for node in self.nodes() {
            if index < base + node.slots.len() {
                return Some(&node.slots[index - base]);
            }
            base += node.slots.len();
        }
        None
    }

    /// Get the value at `index`, if there is one.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slot(index)
            .and_then(|slot| unsafe { slot.load(Ordering::Acquire).as_ref() })
    }

    /// Take the value at `index` out of the directory.
    ///
    /// # Safety
    /// No reference previously returned by [`Directory::get`] or
    /// [`Directory::for_each`] for this index may be used after this call.
    pub unsafe fn remove(&self, index: usize) -> Option<Box<T>> {
        let slot = self.slot(index)?;
        let ptr = slot.swap(null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            Some(Box::from_raw(ptr))
        }
    }

    /// Visit every occupied slot in index order.
    pub fn for_each<'a>(&'a self, mut f: impl FnMut(usize, &'a T)) {
        let mut base = 0;
        for node in self.nodes() {
            for (i, slot) in node.slots.iter().enumerate() {
                if let Some(value) = unsafe { slot.load(Ordering::Acquire).as_ref() } {
                    f(base + i, value);
                }
            }
            base += node.slots.len();
        }
    }

    /// Number of slots, occupied or not.
    pub fn capacity(&self) -> usize {
        self.nodes().map(|node| node.slots.len()).sum()
    }
}

impl<T> Drop for Directory<T> {
    fn drop(&mut self) {
        for slot in self.head.slots.iter() {
            let ptr = slot.swap(null_mut(), Ordering::Relaxed);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
        let mut next = self.head.next.swap(null_mut(), Ordering::Relaxed);
        while !next.is_null() {
            let node = unsafe { Box::from_raw(next) };
            for slot in node.slots.iter() {
                let ptr = slot.load(Ordering::Relaxed);
                if !ptr.is_null() {
                    drop(unsafe { Box::from_raw(ptr) });
                }
            }
            next = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<T: Send + Sync> Sync for Directory<T> {}
unsafe impl<T: Send> Send for Directory<T> {}
