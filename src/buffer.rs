//! A small-vector for plain-old-data items.
//!
//! [`GrowableBuffer`] keeps up to `N` items inline and spills to the heap on demand. All growth
//! goes through `Vec::try_reserve`, so allocation failure surfaces as
//! [`EtwError::OutOfMemory`](crate::err::EtwError::OutOfMemory) instead of aborting.
//!
//! The decoder uses it for the explicit traversal stack and for the remembered
//! length/count values, both of which are tiny for almost every real event.

use std::ops::{Deref, DerefMut};

use crate::err::Result;

#[derive(Debug, Clone)]
enum Storage<T, const N: usize> {
    Inline([T; N]),
    Heap(Vec<T>),
}

#[derive(Debug, Clone)]
pub struct GrowableBuffer<T: Copy + Default, const N: usize> {
    // Only meaningful for inline storage. Heap storage tracks its own length.
    inline_len: usize,
    storage: Storage<T, N>,
}

impl<T: Copy + Default, const N: usize> Default for GrowableBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> GrowableBuffer<T, N> {
    pub fn new() -> Self {
        GrowableBuffer {
            inline_len: 0,
            storage: Storage::Inline([T::default(); N]),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Inline(_) => self.inline_len,
            Storage::Heap(v) => v.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Inline(_) => N,
            Storage::Heap(v) => v.capacity(),
        }
    }

    /// Returns true while the items still live in the inline area.
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, Storage::Inline(_))
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.storage {
            Storage::Inline(items) => &items[..self.inline_len],
            Storage::Heap(v) => v.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &mut self.storage {
            Storage::Inline(items) => &mut items[..self.inline_len],
            Storage::Heap(v) => v.as_mut_slice(),
        }
    }

    /// Moves the inline items to a heap vector with room for at least `min_capacity` items.
    fn spill(&mut self, min_capacity: usize) -> Result<()> {
        if let Storage::Inline(items) = &self.storage {
            let mut heap = Vec::new();
            heap.try_reserve(min_capacity.max(N * 2).max(4))?;
            heap.extend_from_slice(&items[..self.inline_len]);
            self.storage = Storage::Heap(heap);
            self.inline_len = 0;
        }
        Ok(())
    }

    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let wanted = self.len().saturating_add(additional);
        if self.is_inline() {
            if wanted > N {
                self.spill(wanted)?;
            }
            return Ok(());
        }
        if let Storage::Heap(v) = &mut self.storage {
            v.try_reserve(additional)?;
        }
        Ok(())
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if let Storage::Inline(items) = &mut self.storage {
            if self.inline_len < N {
                items[self.inline_len] = value;
                self.inline_len += 1;
                return Ok(());
            }
        }

        self.reserve(1)?;
        match &mut self.storage {
            Storage::Heap(v) => v.push(value),
            // `reserve` never leaves a full inline buffer behind.
            Storage::Inline(items) => {
                items[self.inline_len] = value;
                self.inline_len += 1;
            }
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        match &mut self.storage {
            Storage::Inline(items) => {
                if self.inline_len == 0 {
                    return None;
                }
                self.inline_len -= 1;
                Some(items[self.inline_len])
            }
            Storage::Heap(v) => v.pop(),
        }
    }

    /// Resizes to `new_len`, filling new slots with `value`.
    pub fn resize(&mut self, new_len: usize, value: T) -> Result<()> {
        let len = self.len();
        if new_len > len {
            self.reserve(new_len - len)?;
        }

        match &mut self.storage {
            Storage::Inline(items) => {
                for slot in items.iter_mut().take(new_len).skip(len) {
                    *slot = value;
                }
                self.inline_len = new_len;
            }
            Storage::Heap(v) => v.resize(new_len, value),
        }
        Ok(())
    }

    /// Sets every existing item to `value`.
    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }

    /// Drops all items but keeps the allocation.
    pub fn clear(&mut self) {
        match &mut self.storage {
            Storage::Inline(_) => self.inline_len = 0,
            Storage::Heap(v) => v.clear(),
        }
    }
}

impl<T: Copy + Default, const N: usize> Deref for GrowableBuffer<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy + Default, const N: usize> DerefMut for GrowableBuffer<T, N> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}
