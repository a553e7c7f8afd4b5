//! Managed object references and headers.
//!
//! Every managed object starts with an [`ObjectHeader`]: an opaque
//! type-descriptor word followed by a lock/state word. The allocator writes
//! the header and never looks at the payload; sizes come from the embedder's
//! [`TypeDescriptor`].

#![allow(unsafe_code)]

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Address of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    #[must_use]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    #[must_use]
    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// Header of this object.
    ///
    /// # Safety
    ///
    /// The object must be live: allocated by a space of a heap that is still
    /// alive and not yet freed.
    #[must_use]
    pub unsafe fn header<'a>(self) -> &'a ObjectHeader {
        // SAFETY: caller guarantees a live object, whose first 16 bytes are a
        // header written by `install_header`.
        unsafe { &*(self.addr() as *const ObjectHeader) }
    }

    /// Type word stored in the header.
    ///
    /// # Safety
    ///
    /// Same contract as [`ObjRef::header`].
    #[must_use]
    pub unsafe fn type_word(self) -> usize {
        // SAFETY: forwarded contract.
        unsafe { self.header() }.type_word()
    }

    /// Payload bytes following the header.
    ///
    /// # Safety
    ///
    /// The object must be live, `len` must not exceed its usable size minus
    /// [`HEADER_SIZE`], and the caller must not create aliasing mutable views.
    #[must_use]
    pub unsafe fn payload_mut<'a>(self, len: usize) -> &'a mut [u8] {
        // SAFETY: forwarded contract.
        unsafe { std::slice::from_raw_parts_mut((self.addr() + HEADER_SIZE) as *mut u8, len) }
    }

    /// Read the `index`-th machine word of the payload.
    ///
    /// # Safety
    ///
    /// The object must be live and the word must lie within its allocation.
    #[must_use]
    pub unsafe fn payload_word(self, index: usize) -> usize {
        let at = self.addr() + HEADER_SIZE + index * std::mem::size_of::<usize>();
        // SAFETY: forwarded contract; payload words are 8-byte aligned.
        unsafe { (at as *const usize).read() }
    }

    /// Write the `index`-th machine word of the payload.
    ///
    /// # Safety
    ///
    /// Same contract as [`ObjRef::payload_word`], plus exclusive access.
    pub unsafe fn set_payload_word(self, index: usize, value: usize) {
        let at = self.addr() + HEADER_SIZE + index * std::mem::size_of::<usize>();
        // SAFETY: forwarded contract.
        unsafe { (at as *mut usize).write(value) }
    }
}

/// Fixed object header.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    type_word: AtomicUsize,
    lock_word: AtomicUsize,
}

/// Size of [`ObjectHeader`]; also the smallest valid object.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    /// Zero until the allocating thread installs the header.
    #[must_use]
    pub fn type_word(&self) -> usize {
        self.type_word.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn lock_word(&self) -> usize {
        self.lock_word.load(Ordering::Relaxed)
    }
}

/// Write a fresh header into zeroed object memory.
///
/// # Safety
///
/// `obj` must point at least [`HEADER_SIZE`] writable bytes owned exclusively
/// by the caller.
pub(crate) unsafe fn install_header(obj: ObjRef, type_word: usize) {
    debug_assert_ne!(type_word, 0, "type word 0 marks an unfinished object");
    // SAFETY: caller guarantees exclusive ownership of the header bytes.
    let header = unsafe { obj.header() };
    header.lock_word.store(0, Ordering::Relaxed);
    header.type_word.store(type_word, Ordering::Relaxed);
}

/// What the allocator needs to know about an object's type.
pub trait TypeDescriptor: Send + Sync {
    /// Opaque nonzero value stored in the header type slot.
    fn type_word(&self) -> usize;

    fn is_primitive_array(&self) -> bool {
        false
    }

    fn is_string(&self) -> bool {
        false
    }

    /// Byte size of a fully constructed `obj` of this type, header included.
    fn compute_size(&self, obj: ObjRef) -> usize;
}

/// Layout of a [`BasicType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Fixed-size instance of `size` bytes including the header.
    Instance { size: usize },
    /// Length in payload word 0, then `len * component_size` bytes.
    PrimitiveArray { component_size: usize },
    /// Length in payload word 0, then `len` UTF-16 units.
    String,
}

/// Minimal self-describing type for embedders without their own type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicType {
    word: usize,
    shape: Shape,
}

impl BasicType {
    /// `word` must be nonzero.
    #[must_use]
    pub const fn new(word: usize, shape: Shape) -> Self {
        assert!(word != 0, "type word 0 is reserved");
        Self { word, shape }
    }

    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    /// Bytes needed for an object of this type holding `len` elements.
    #[must_use]
    pub const fn size_for(&self, len: usize) -> usize {
        match self.shape {
            Shape::Instance { size } => size,
            Shape::PrimitiveArray { component_size } => {
                HEADER_SIZE + std::mem::size_of::<usize>() + len * component_size
            }
            Shape::String => HEADER_SIZE + std::mem::size_of::<usize>() + len * 2,
        }
    }

    /// Constructor for [`Heap::alloc_object`](crate::heap::Heap::alloc_object)
    /// that stores the element count.
    pub fn init_length(len: usize) -> impl FnOnce(ObjRef, usize) {
        move |obj, _usable| {
            // SAFETY: called by the heap on a freshly allocated object of at
            // least `size_for(len)` bytes, before it is published.
            unsafe { obj.set_payload_word(0, len) }
        }
    }
}

impl TypeDescriptor for BasicType {
    fn type_word(&self) -> usize {
        self.word
    }

    fn is_primitive_array(&self) -> bool {
        matches!(self.shape, Shape::PrimitiveArray { .. })
    }

    fn is_string(&self) -> bool {
        matches!(self.shape, Shape::String)
    }

    fn compute_size(&self, obj: ObjRef) -> usize {
        match self.shape {
            Shape::Instance { size } => size,
            // SAFETY: length word is written during construction of every
            // array/string object of this type.
            _ => self.size_for(unsafe { obj.payload_word(0) }),
        }
    }
}
