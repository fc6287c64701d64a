pub mod bitmap;

use crate::{BlockError, BlockResult};
use std::alloc::{self, Layout};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr::NonNull;

pub use bitmap::Bitmap;

pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type BlockFutureResult<'a, T> = BoxedFuture<'a, BlockResult<T>>;

/// Boxed future type for functions that are infallible
pub type InfallibleFuture<'a> = BoxedFuture<'a, ()>;

/// Defines a `#[repr]` enum of flag or identifier values, plus a checked conversion from the
/// raw representation.
#[macro_export]
macro_rules! numerical_enum {
    (
        $(#[$attr:meta])*
        pub enum $enum_name:ident as $repr:tt {
            $(
                $(#[$id_attr:meta])*
                $identifier:ident = $value:literal,
            )+
        }
    ) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        #[repr($repr)]
        pub enum $enum_name {
            $(
                $(#[$id_attr])*
                $identifier = $value,
            )+
        }

        impl TryFrom<$repr> for $enum_name {
            type Error = $crate::BlockError;
            fn try_from(val: $repr) -> $crate::BlockResult<Self> {
                match val {
                    $($value => Ok($enum_name::$identifier),)*
                    _ => Err($crate::BlockError::invalid(format!(
                        "Invalid value for {}: {:x}",
                        stringify!($enum_name),
                        val
                    ))),
                }
            }
        }
    }
}

/// Defines a bit set over the values of a `numerical_enum!` flag type
#[macro_export]
macro_rules! flag_set {
    (
        $(#[$attr:meta])*
        pub struct $set:ident($flag:ident as $repr:ty);
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
        pub struct $set($repr);

        impl $set {
            pub const fn empty() -> Self {
                $set(0)
            }

            pub fn bits(&self) -> $repr {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn contains(&self, flag: $flag) -> bool {
                self.0 & (flag as $repr) != 0
            }

            pub fn overlap_with(&self, other: impl Into<$set>) -> $set {
                $set(self.0 & other.into().0)
            }

            pub fn add(&mut self, other: impl Into<$set>) {
                self.0 |= other.into().0
            }

            pub fn remove(&mut self, other: impl Into<$set>) {
                self.0 &= !other.into().0
            }

            pub fn with(mut self, other: impl Into<$set>) -> Self {
                self.add(other);
                self
            }

            pub fn without(mut self, other: impl Into<$set>) -> Self {
                self.remove(other);
                self
            }
        }

        impl From<$flag> for $set {
            fn from(flag: $flag) -> Self {
                $set(flag as $repr)
            }
        }

        impl<T: Into<$set>> std::ops::BitOr<T> for $set {
            type Output = $set;
            fn bitor(self, rhs: T) -> $set {
                self.with(rhs)
            }
        }

        impl std::ops::BitOr for $flag {
            type Output = $set;
            fn bitor(self, rhs: $flag) -> $set {
                $set::from(self).with(rhs)
            }
        }

        impl std::fmt::Debug for $set {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:#x})", stringify!($set), self.0)
            }
        }
    };
}

/// Defines an enum whose variants each wrap a distinct type, with conversions between the
/// enum and every wrapped type.
#[macro_export]
macro_rules! splittable_enum {
    (
        $(#[$attr:meta])*
        pub enum $enum_name:ident {
            $(
                $variant:ident($encapsulated:path),
            )+
        }
    ) => {
        $(#[$attr])*
        pub enum $enum_name {
            $(
                $variant($encapsulated),
            )+
        }

        $(
            impl TryFrom<$enum_name> for $encapsulated {
                type Error = $crate::BlockError;
                fn try_from(val: $enum_name) -> $crate::BlockResult<$encapsulated> {
                    match val {
                        $enum_name::$variant(obj) => Ok(obj),
                        #[allow(unreachable_patterns)]
                        _ => Err($crate::BlockError::invalid(format!(
                            "{:?} is not of variant {}",
                            val,
                            stringify!($variant),
                        ))),
                    }
                }
            }

            impl<'a> TryFrom<&'a $enum_name> for &'a $encapsulated {
                type Error = $crate::BlockError;
                fn try_from(val: &'a $enum_name) -> $crate::BlockResult<&'a $encapsulated> {
                    match val {
                        $enum_name::$variant(obj) => Ok(obj),
                        #[allow(unreachable_patterns)]
                        _ => Err($crate::BlockError::invalid(format!(
                            "{:?} is not of variant {}",
                            val,
                            stringify!($variant),
                        ))),
                    }
                }
            }

            impl From<$encapsulated> for $enum_name {
                fn from(val: $encapsulated) -> $enum_name {
                    $enum_name::$variant(val)
                }
            }
        )*
    }
}

/// Iterates over a `Vec<W>` of weak references, upgrading each through `upgrade`.  Elements that
/// can no longer be upgraded are dropped from the vector along the way (via `swap_remove()`).
pub struct WeakAutoDeleteIterator<'a, W, S, F: Fn(&W) -> Option<S>> {
    vec: &'a mut Vec<W>,
    index: usize,
    upgrade: F,
}

impl<'a, W, S, F: Fn(&W) -> Option<S>> WeakAutoDeleteIterator<'a, W, S, F> {
    pub fn from_vec(vec: &'a mut Vec<W>, upgrade: F) -> Self {
        WeakAutoDeleteIterator {
            vec,
            index: 0,
            upgrade,
        }
    }
}

impl<'a, W, S, F: Fn(&W) -> Option<S>> Iterator for WeakAutoDeleteIterator<'a, W, S, F> {
    type Item = S;

    fn next(&mut self) -> Option<S> {
        while self.index < self.vec.len() {
            if let Some(item) = (self.upgrade)(&self.vec[self.index]) {
                self.index += 1;
                return Some(item);
            }
            self.vec.swap_remove(self.index);
        }
        None
    }
}

pub trait IntAlignment: Sized {
    /// Align `self` down to the closest value less or equal to `self` that is aligned to
    /// `alignment`.  `alignment` must be a power of two.
    fn align_down<T: Into<Self>>(self, alignment: T) -> Self;

    /// Align `self` up to the closest value greater or equal to `self` that is aligned to
    /// `alignment`.  Returns `None` if and only if there is no such value.
    /// `alignment` must be a power of two.
    fn align_up<T: Into<Self>>(self, alignment: T) -> Option<Self>;

    fn is_aligned<T: Into<Self>>(self, alignment: T) -> bool;
}

macro_rules! impl_int_alignment_for_primitive {
    ($type:tt) => {
        impl IntAlignment for $type {
            fn align_down<T: Into<Self>>(self, alignment: T) -> Self {
                let alignment: Self = alignment.into();
                debug_assert!(alignment.is_power_of_two());

                self & !(alignment - 1)
            }

            fn align_up<T: Into<Self>>(self, alignment: T) -> Option<Self> {
                let alignment: Self = alignment.into();
                debug_assert!(alignment.is_power_of_two());

                if self & (alignment - 1) == 0 {
                    return Some(self);
                }
                (self | (alignment - 1)).checked_add(1)
            }

            fn is_aligned<T: Into<Self>>(self, alignment: T) -> bool {
                let alignment: Self = alignment.into();
                debug_assert!(alignment.is_power_of_two());

                self & (alignment - 1) == 0
            }
        }
    };
}

impl_int_alignment_for_primitive!(u32);
impl_int_alignment_for_primitive!(u64);
impl_int_alignment_for_primitive!(usize);

/// `min()`, but treating zero as "no limit"
pub fn min_non_zero(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => std::cmp::min(a, b),
    }
}

pub fn buffer_is_zero(buf: &[u8]) -> bool {
    // SAFETY: Any bit pattern is a valid `u64`
    let (head, words, tail) = unsafe { buf.align_to::<u64>() };
    head.iter().all(|b| *b == 0) && words.iter().all(|w| *w == 0) && tail.iter().all(|b| *b == 0)
}

pub trait Overlaps {
    fn overlaps(&self, other: &Self) -> bool;
}

impl<I: Ord> Overlaps for std::ops::Range<I> {
    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Heap buffer with a chosen memory alignment, for padding units and bounce buffers.  Always
/// zero-initialized.
pub struct IoBuffer {
    pointer: NonNull<u8>,
    size: usize,
    layout: Option<Layout>,
}

// SAFETY: The buffer owns its allocation exclusively, like a `Box<[u8]>`
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    pub fn new(size: usize, alignment: usize) -> BlockResult<Self> {
        let layout = Layout::from_size_align(size, alignment)?;
        if size == 0 {
            return Ok(IoBuffer {
                pointer: NonNull::dangling(),
                size: 0,
                layout: None,
            });
        }

        // SAFETY: `layout` has a non-zero size
        let pointer = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or_else(|| {
            BlockError::from_desc(format!(
                "Cannot allocate a {}-byte buffer aligned to {}",
                size, alignment
            ))
        })?;

        Ok(IoBuffer {
            pointer,
            size,
            layout: Some(layout),
        })
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `size` initialized bytes (or a dangling pointer for zero bytes)
        unsafe { std::slice::from_raw_parts(self.pointer.as_ptr(), self.size) }
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: As for `deref()`, and `&mut self` makes the access exclusive
        unsafe { std::slice::from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: Allocated in `new()` with this layout
            unsafe { alloc::dealloc(self.pointer.as_ptr(), layout) };
        }
    }
}

macro_rules! io_vector {
    ($name:ident, $slice:ty, $shorter_slice:ty, $split:ident) => {
        /// Scatter/gather list of byte buffers.  Never holds empty buffers.
        pub struct $name<'a> {
            buffers: Vec<$slice>,
            len: u64,
        }

        impl<'a> $name<'a> {
            pub fn new() -> Self {
                $name {
                    buffers: Vec::new(),
                    len: 0,
                }
            }

            pub fn push(&mut self, buf: $slice) {
                if !buf.is_empty() {
                    self.len += buf.len() as u64;
                    self.buffers.push(buf);
                }
            }

            /// `push()` for a buffer that lives shorter than the vector so far
            pub fn with_pushed<'b>(self, buf: $shorter_slice) -> $name<'b>
            where
                'a: 'b,
            {
                let mut vec: $name<'b> = self;
                vec.push(buf);
                vec
            }

            /// Insert `buf` at buffer position `index`
            pub fn with_inserted<'b>(self, index: usize, buf: $shorter_slice) -> $name<'b>
            where
                'a: 'b,
            {
                let mut vec: $name<'b> = self;
                if !buf.is_empty() {
                    vec.len += buf.len() as u64;
                    vec.buffers.insert(index, buf);
                }
                vec
            }

            /// Total number of bytes
            pub fn len(&self) -> u64 {
                self.len
            }

            pub fn buffer_count(&self) -> usize {
                self.buffers.len()
            }

            pub fn is_empty(&self) -> bool {
                self.len == 0
            }

            /// Split into `[0, mid)` and `[mid, len)`; a buffer spanning `mid` is cut in two
            pub fn split_at(self, mid: u64) -> ($name<'a>, $name<'a>) {
                let mid = std::cmp::min(mid, self.len);
                let mut head = $name::new();
                let mut tail = $name::new();

                let mut pos = 0u64;
                for buf in self.buffers {
                    let buf_len = buf.len() as u64;
                    if pos + buf_len <= mid {
                        head.push(buf);
                    } else if pos >= mid {
                        tail.push(buf);
                    } else {
                        let (a, b) = buf.$split((mid - pos) as usize);
                        head.push(a);
                        tail.push(b);
                    }
                    pos += buf_len;
                }

                (head, tail)
            }

            pub fn split_tail_at(self, mid: u64) -> $name<'a> {
                self.split_at(mid).1
            }

            /// Gather the whole content into `dest`, which must be exactly as long
            pub fn copy_into_slice(&self, dest: &mut [u8]) {
                assert_eq!(dest.len() as u64, self.len);
                let mut pos = 0;
                for buf in &self.buffers {
                    dest[pos..pos + buf.len()].copy_from_slice(buf);
                    pos += buf.len();
                }
            }

            pub fn is_zero(&self) -> bool {
                self.buffers.iter().all(|buf| buffer_is_zero(buf))
            }

            /// Whether all buffer addresses are aligned to `mem_alignment`, and all buffer
            /// lengths to both alignments
            pub fn is_aligned(&self, mem_alignment: usize, req_alignment: usize) -> bool {
                let addr_mask = mem_alignment - 1;
                let len_mask = addr_mask | (req_alignment - 1);
                self.buffers.iter().all(|buf| {
                    (buf.as_ptr() as usize) & addr_mask == 0 && buf.len() & len_mask == 0
                })
            }
        }

        impl<'a> Default for $name<'a> {
            fn default() -> Self {
                $name::new()
            }
        }

        impl<'a> From<$slice> for $name<'a> {
            fn from(buf: $slice) -> Self {
                let mut vec = $name::new();
                vec.push(buf);
                vec
            }
        }
    };
}

io_vector!(IoVector, &'a [u8], &'b [u8], split_at);
io_vector!(IoVectorMut, &'a mut [u8], &'b mut [u8], split_at_mut);

impl IoVector<'_> {
    /// `iovec` array for vectored system calls.  The pointers are only valid while `self` is.
    pub fn to_iovec(&self) -> Vec<libc::iovec> {
        self.buffers
            .iter()
            .map(|buf| libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect()
    }
}

impl IoVectorMut<'_> {
    /// `iovec` array for vectored system calls that write into the buffers.  The pointers are
    /// only valid while `self` is, and while it is not otherwise accessed.
    pub fn to_iovec(&mut self) -> Vec<libc::iovec> {
        self.buffers
            .iter_mut()
            .map(|buf| libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect()
    }

    pub fn fill(&mut self, value: u8) {
        for buf in self.buffers.iter_mut() {
            buf.fill(value);
        }
    }

    /// Scatter `src` over the buffers; it must be exactly as long as the vector
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert_eq!(src.len() as u64, self.len);
        let mut pos = 0;
        for buf in self.buffers.iter_mut() {
            let buf_len = buf.len();
            buf.copy_from_slice(&src[pos..pos + buf_len]);
            pos += buf_len;
        }
    }
}
