//! An in-process host runtime with reference-counted arrays.
//!
//! [`MemoryHost`] implements [`HostRuntime`] over buffers it allocates
//! itself. It supports everything a foreign runtime might hand over:
//! arbitrary byte strides (negative and padded), non-native byte order,
//! misaligned data, read-only arrays, write-back copies, and not yet
//! materialized nested sequences. It also counts references and copies so
//! callers can check what a binding did.
//!
//! The host is single-threaded (`!Sync`), like the runtimes it stands in for.

mod builder;
mod scalar;

pub use builder::ArrayBuilder;
pub use scalar::Scalar;

use crate::element::{DType, Element};
use crate::host::{ConvertRequest, HostFailure, HostRuntime, Probe};
use crate::layout::{is_contiguous, ArrayFlags, ArrayLayout, MemoryOrder};
use std::cell::{Cell, RefCell};

/// Handle to an array owned by a [`MemoryHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(usize);

/// Input object understood by [`MemoryHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostObject {
    /// An existing host array.
    Array(ArrayId),
    /// Array-like data that is not an array yet, values in row-major order.
    Nested { dims: Vec<usize>, values: Vec<Scalar> },
    /// Anything else.
    Opaque(String),
}

impl HostObject {
    /// Nested sequence of the given shape.
    ///
    /// # Panics
    /// Panics if `values` does not hold exactly one value per element.
    pub fn nested(dims: &[usize], values: Vec<Scalar>) -> Self {
        assert_eq!(
            values.len(),
            dims.iter().product::<usize>(),
            "nested sequence of shape {dims:?} needs one value per element"
        );
        HostObject::Nested {
            dims: dims.to_vec(),
            values,
        }
    }

    pub fn as_array_id(&self) -> Option<ArrayId> {
        match self {
            HostObject::Array(id) => Some(*id),
            _ => None,
        }
    }
}

/// One array's storage and bookkeeping.
struct Slot {
    /// Backing words; `Cell` so writes through `data_ptr` are permitted.
    buffer: Box<[Cell<u64>]>,
    /// Byte offset of the element at index zero.
    offset: usize,
    dtype: DType,
    dims: Vec<usize>,
    strides: Vec<isize>,
    writable: bool,
    refs: usize,
    /// Original this array writes back into on final release.
    write_back: Option<ArrayId>,
    /// Pending write-back copies of this array; it is read-only while any exist.
    locked: usize,
}

impl Slot {
    /// Allocate zeroed storage covering every element reachable through
    /// `strides`, with element zero placed `misalign` bytes past the lowest
    /// reachable address.
    fn new(dtype: DType, dims: &[usize], strides: Vec<isize>, misalign: usize, writable: bool) -> Self {
        let item = dtype.size() as isize;
        let (mut low, mut high) = (0isize, item);
        if !dims.contains(&0) {
            for (&d, &s) in dims.iter().zip(&strides) {
                let reach = s * (d as isize - 1);
                if reach < 0 {
                    low += reach;
                } else {
                    high += reach;
                }
            }
        }
        let bytes = (high - low) as usize + misalign;
        let words = bytes.div_ceil(8).max(1);
        Self {
            buffer: (0..words).map(|_| Cell::new(0)).collect(),
            offset: (-low) as usize + misalign,
            dtype,
            dims: dims.to_vec(),
            strides,
            writable,
            refs: 1,
            write_back: None,
            locked: 0,
        }
    }

    fn dense(dtype: DType, dims: &[usize], order: MemoryOrder, writable: bool) -> Self {
        let strides = order.byte_strides(dims, dtype.size());
        Self::new(dtype, dims, strides, 0, writable)
    }

    fn data_ptr(&self) -> *mut u8 {
        let base = self.buffer.as_ptr() as *mut u8;
        unsafe { base.add(self.offset) }
    }

    fn is_writable(&self) -> bool {
        self.writable && self.locked == 0
    }

    fn element_ptr(&self, idx: &[usize]) -> *mut u8 {
        assert_eq!(idx.len(), self.dims.len(), "index rank does not match array rank");
        let mut pos = 0isize;
        for ((&i, &d), &s) in idx.iter().zip(&self.dims).zip(&self.strides) {
            assert!(i < d, "index {i} out of bounds for extent {d}");
            pos += s * i as isize;
        }
        unsafe { self.data_ptr().offset(pos) }
    }

    fn read(&self, idx: &[usize]) -> Scalar {
        let size = self.dtype.size();
        let mut buf = [0u8; 16];
        unsafe { std::ptr::copy_nonoverlapping(self.element_ptr(idx), buf.as_mut_ptr(), size) };
        Scalar::decode(&buf[..size], self.dtype)
    }

    fn write(&self, idx: &[usize], value: Scalar) {
        let mut buf = [0u8; 16];
        value.encode(self.dtype, &mut buf);
        self.write_bytes(idx, &buf[..self.dtype.size()]);
    }

    fn write_bytes(&self, idx: &[usize], bytes: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.element_ptr(idx), bytes.len()) };
    }

    /// Copy every element of `src` into `self`, converting element types.
    fn copy_from(&self, src: &Slot) {
        for_each_index(&self.dims, |idx| self.write(idx, src.read(idx)));
    }

    fn layout(&self) -> ArrayLayout {
        let item = self.dtype.size();
        let align = self.dtype.element_type.alignment() as isize;
        let aligned = (self.data_ptr() as usize) % (align as usize) == 0
            && self.strides.iter().all(|&s| s % align == 0);
        ArrayLayout {
            dtype: self.dtype,
            dims: self.dims.clone(),
            strides: self.strides.clone(),
            flags: ArrayFlags {
                aligned,
                writable: self.is_writable(),
                row_major: is_contiguous(&self.dims, &self.strides, item, MemoryOrder::RowMajor),
                column_major: is_contiguous(&self.dims, &self.strides, item, MemoryOrder::ColumnMajor),
            },
        }
    }
}

/// Visit every index of `dims` in row-major order.
pub(crate) fn for_each_index(dims: &[usize], mut f: impl FnMut(&[usize])) {
    if dims.contains(&0) {
        return;
    }
    let mut idx = vec![0usize; dims.len()];
    loop {
        f(&idx);
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < dims[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

/// Reference in-process host runtime.
///
/// # Example
/// ```rust
/// use strided_host::{HostRuntime, MemoryHost, MemoryOrder, Scalar};
///
/// let host = MemoryHost::new();
/// let id = host.from_fn::<i32>(&[2, 2], MemoryOrder::ColumnMajor, |idx| (idx[0] + 2 * idx[1]) as i32);
/// assert_eq!(host.get(id, &[1, 1]), Scalar::Int(3));
/// assert!(host.layout(id).flags.column_major);
/// host.release(id);
/// assert_eq!(host.live_arrays(), 0);
/// ```
#[derive(Default)]
pub struct MemoryHost {
    slots: RefCell<Vec<Option<Slot>>>,
    copies: Cell<usize>,
    fail_next: Cell<bool>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a native array of `T` in `order`, filled from `f(index)`.
    ///
    /// The caller owns the one reference the new array starts with.
    pub fn from_fn<T: Element>(
        &self,
        dims: &[usize],
        order: MemoryOrder,
        mut f: impl FnMut(&[usize]) -> T,
    ) -> ArrayId {
        let slot = Slot::dense(DType::of::<T>(), dims, order, true);
        for_each_index(dims, |idx| slot.write_bytes(idx, bytemuck::bytes_of(&f(idx))));
        self.insert(slot)
    }

    /// Create a native array of `T` from `data` laid out densely in `order`.
    ///
    /// # Panics
    /// Panics if `data` does not hold exactly one value per element.
    pub fn from_vec<T: Element>(&self, dims: &[usize], order: MemoryOrder, data: Vec<T>) -> ArrayId {
        assert_eq!(data.len(), dims.iter().product::<usize>(), "data length does not match shape");
        let slot = Slot::dense(DType::of::<T>(), dims, order, true);
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.data_ptr(), bytes.len()) };
        self.insert(slot)
    }

    /// Start describing an array with a non-default layout.
    pub fn array(&self, element_type: crate::ElementType, dims: &[usize]) -> ArrayBuilder<'_> {
        ArrayBuilder::new(self, element_type, dims)
    }

    /// Read one element.
    ///
    /// # Panics
    /// Panics if `id` was released or the index is out of bounds.
    pub fn get(&self, id: ArrayId, idx: &[usize]) -> Scalar {
        self.with_slot(id, |slot| slot.read(idx))
    }

    /// Read one element converted to `T` with `as`-cast semantics.
    pub fn get_as<T: Element>(&self, id: ArrayId, idx: &[usize]) -> T {
        let mut buf = [0u8; 16];
        self.get(id, idx).encode(DType::of::<T>(), &mut buf);
        bytemuck::pod_read_unaligned(&buf[..std::mem::size_of::<T>()])
    }

    /// Write one element, converting to the array's element type.
    ///
    /// # Panics
    /// Panics if `id` was released or the index is out of bounds.
    pub fn set(&self, id: ArrayId, idx: &[usize], value: impl Into<Scalar>) {
        let value = value.into();
        self.with_slot(id, |slot| slot.write(idx, value))
    }

    /// Current reference count, 0 once freed.
    pub fn ref_count(&self, id: ArrayId) -> usize {
        self.slots
            .borrow()
            .get(id.0)
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.refs)
    }

    pub fn is_alive(&self, id: ArrayId) -> bool {
        self.ref_count(id) > 0
    }

    /// Number of arrays not yet freed.
    pub fn live_arrays(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    /// Number of arrays created by [`HostRuntime::convert`] or
    /// [`HostRuntime::allocate`].
    pub fn copy_count(&self) -> usize {
        self.copies.get()
    }

    /// Make the next `convert` or `allocate` fail.
    pub fn fail_next_copy(&self) {
        self.fail_next.set(true);
    }

    /// The array a write-back copy will write into.
    pub fn base_of(&self, id: ArrayId) -> Option<ArrayId> {
        self.with_slot(id, |slot| slot.write_back)
    }

    fn insert(&self, slot: Slot) -> ArrayId {
        let mut slots = self.slots.borrow_mut();
        let id = ArrayId(slots.len());
        log::trace!("created {id:?}: {} {:?}", slot.dtype, slot.dims);
        slots.push(Some(slot));
        id
    }

    fn with_slot<R>(&self, id: ArrayId, f: impl FnOnce(&Slot) -> R) -> R {
        let slots = self.slots.borrow();
        match slots.get(id.0).and_then(Option::as_ref) {
            Some(slot) => f(slot),
            None => panic!("{id:?} has already been freed"),
        }
    }

    fn with_slot_mut<R>(&self, id: ArrayId, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut slots = self.slots.borrow_mut();
        match slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(slot) => f(slot),
            None => panic!("{id:?} has already been freed"),
        }
    }

    fn take_failure(&self, what: &str) -> Result<(), HostFailure> {
        if self.fail_next.replace(false) {
            return Err(HostFailure::new(format!("{what} failed: out of memory")));
        }
        Ok(())
    }

    fn check_writable(&self, id: ArrayId) -> Result<(), HostFailure> {
        if self.with_slot(id, Slot::is_writable) {
            Ok(())
        } else {
            Err(HostFailure::new(format!("{id:?} is read-only")))
        }
    }

    /// A new row-major array holding a nested sequence.
    fn materialize(&self, dims: &[usize], values: &[Scalar]) -> ArrayId {
        let dtype = DType::native(Scalar::infer_element_type(values));
        let slot = Slot::dense(dtype, dims, MemoryOrder::RowMajor, true);
        let mut values = values.iter();
        for_each_index(dims, |idx| {
            if let Some(&value) = values.next() {
                slot.write(idx, value);
            }
        });
        self.insert(slot)
    }
}

impl HostRuntime for MemoryHost {
    type Object = HostObject;
    type Array = ArrayId;

    fn as_array(&self, object: &HostObject) -> Option<ArrayId> {
        object.as_array_id()
    }

    fn layout(&self, array: ArrayId) -> ArrayLayout {
        self.with_slot(array, Slot::layout)
    }

    fn data_ptr(&self, array: ArrayId) -> *mut u8 {
        self.with_slot(array, Slot::data_ptr)
    }

    fn acquire(&self, array: ArrayId) {
        self.with_slot_mut(array, |slot| slot.refs += 1);
    }

    fn release(&self, array: ArrayId) {
        let freed = {
            let mut slots = self.slots.borrow_mut();
            let Some(entry) = slots.get_mut(array.0) else {
                panic!("{array:?} was never created");
            };
            let Some(slot) = entry.as_mut() else {
                panic!("{array:?} released more often than acquired");
            };
            slot.refs -= 1;
            if slot.refs > 0 {
                return;
            }
            entry.take()
        };
        let Some(freed) = freed else { return };
        log::trace!("freed {array:?}");
        if let Some(base) = freed.write_back {
            log::debug!("writing {array:?} back into {base:?}");
            self.with_slot_mut(base, |slot| slot.locked -= 1);
            self.with_slot(base, |slot| slot.copy_from(&freed));
            self.release(base);
        }
    }

    fn probe(&self, object: &HostObject, writable: bool) -> Result<Probe<ArrayId>, HostFailure> {
        match object {
            HostObject::Array(id) => {
                if writable {
                    self.check_writable(*id)?;
                }
                self.acquire(*id);
                Ok(Probe::Array(*id))
            }
            HostObject::Nested { .. } if writable => Err(HostFailure::new(
                "cannot write back into a nested sequence",
            )),
            HostObject::Nested { dims, values } => Ok(Probe::Described {
                dtype: DType::native(Scalar::infer_element_type(values)),
                dims: dims.clone(),
            }),
            HostObject::Opaque(name) => Err(HostFailure::new(format!("{name} is not array-like"))),
        }
    }

    fn coerce(&self, object: &HostObject, rank: usize, writable: bool) -> Result<ArrayId, HostFailure> {
        match object {
            HostObject::Array(id) => {
                let actual = self.with_slot(*id, |slot| slot.dims.len());
                if actual != rank {
                    return Err(HostFailure::new(format!(
                        "expected a {rank}-d array, got {actual}-d"
                    )));
                }
                if writable {
                    self.check_writable(*id)?;
                }
                self.acquire(*id);
                Ok(*id)
            }
            HostObject::Nested { .. } if writable => Err(HostFailure::new(
                "cannot write back into a nested sequence",
            )),
            HostObject::Nested { dims, values } => {
                if dims.len() != rank {
                    return Err(HostFailure::new(format!(
                        "expected a {rank}-d sequence, got {}-d",
                        dims.len()
                    )));
                }
                Ok(self.materialize(dims, values))
            }
            HostObject::Opaque(name) => Err(HostFailure::new(format!("{name} is not array-like"))),
        }
    }

    fn convert(&self, array: ArrayId, request: &ConvertRequest) -> Result<ArrayId, HostFailure> {
        self.take_failure("conversion copy")?;
        if request.write_back {
            self.check_writable(array)?;
        }
        let copy = self.with_slot(array, |src| {
            let order = request.order.unwrap_or_else(|| {
                let layout = src.layout();
                if layout.flags.column_major && !layout.flags.row_major {
                    MemoryOrder::ColumnMajor
                } else {
                    MemoryOrder::RowMajor
                }
            });
            let copy = Slot::dense(request.dtype, &src.dims, order, request.writable);
            copy.copy_from(src);
            copy
        });
        let copy = if request.write_back {
            self.with_slot_mut(array, |src| {
                src.refs += 1;
                src.locked += 1;
            });
            Slot {
                write_back: Some(array),
                ..copy
            }
        } else {
            copy
        };
        self.copies.set(self.copies.get() + 1);
        Ok(self.insert(copy))
    }

    fn allocate(&self, dtype: DType, dims: &[usize], order: MemoryOrder) -> Result<ArrayId, HostFailure> {
        self.take_failure("allocation")?;
        self.copies.set(self.copies.get() + 1);
        Ok(self.insert(Slot::dense(dtype, dims, order, true)))
    }

    fn fill_from_object(&self, array: ArrayId, object: &HostObject) -> Result<(), HostFailure> {
        let dims = self.with_slot(array, |slot| slot.dims.clone());
        match object {
            HostObject::Nested { dims: src_dims, values } => {
                if *src_dims != dims {
                    return Err(HostFailure::new(format!(
                        "cannot fill {dims:?} array from {src_dims:?} sequence"
                    )));
                }
                self.with_slot(array, |slot| {
                    let mut values = values.iter();
                    for_each_index(&dims, |idx| {
                        if let Some(&value) = values.next() {
                            slot.write(idx, value);
                        }
                    });
                });
                Ok(())
            }
            HostObject::Array(src) => {
                let slots = self.slots.borrow();
                match (
                    slots.get(src.0).and_then(Option::as_ref),
                    slots.get(array.0).and_then(Option::as_ref),
                ) {
                    (Some(src), Some(dst)) if src.dims == dims => {
                        dst.copy_from(src);
                        Ok(())
                    }
                    _ => Err(HostFailure::new(format!("cannot fill {array:?} from {src:?}"))),
                }
            }
            HostObject::Opaque(name) => Err(HostFailure::new(format!("{name} is not array-like"))),
        }
    }
}
