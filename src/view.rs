//! Fixed-rank typed views over host buffers.
//!
//! This module provides `HostView` and `HostViewMut`, which bind once to a
//! host object and then behave like a strided array view over its buffer:
//!
//! - Const-generic rank that must match the host array exactly
//! - Zero-copy when the buffer is aligned, native-endian and already `T`
//! - Otherwise a casting-checked conversion copy made by the host
//! - Shape and element strides snapshotted at bind time
//!
//! The address of element `(i0, .., iN-1)` is `base + sum(stride_k * i_k)`.
//! The host keeps ownership of the memory; a view only guarantees that the
//! buffer stays alive, not that nobody else writes to it. Two views, or a
//! view and the host itself, may reach the same elements, so the safe API
//! reads and writes by value and only `unsafe` methods hand out references.

use crate::casting::CastingSafety;
use crate::element::{DType, Element};
use crate::host::{ConvertRequest, HostArrayRef, HostRuntime};
use crate::{Result, ViewError};
use std::fmt;
use std::marker::PhantomData;

// ============================================================================
// Binding
// ============================================================================

/// Buffer, shape and element strides captured at bind time.
struct Bound<'h, H: HostRuntime, const N: usize> {
    array: HostArrayRef<'h, H>,
    ptr: *mut u8,
    shape: [usize; N],
    strides: [isize; N],
    copied: bool,
}

/// Resolve `object` into an `N`-dimensional buffer of `T`, copying if needed.
fn bind<'h, H: HostRuntime, T: Element, const N: usize>(
    host: &'h H,
    object: &H::Object,
    casting: CastingSafety,
    writable: bool,
) -> Result<Bound<'h, H, N>> {
    let target = DType::of::<T>();

    let source = if casting.is_representation_preserving() {
        let array = host.as_array(object).ok_or_else(|| {
            ViewError::TypeMismatch("cannot cast object to requested type".to_string())
        })?;
        let rank = host.layout(array).rank();
        if rank != N {
            return Err(ViewError::TypeMismatch(format!(
                "array has the wrong number of dimensions: expected {N}, got {rank}"
            )));
        }
        HostArrayRef::acquire(host, array)
    } else {
        HostArrayRef::from_owned(host, host.coerce(object, N, writable)?)
    };

    let layout = source.layout();
    if layout.rank() != N {
        return Err(ViewError::Conversion(format!(
            "host coerced object to rank {} instead of {N}",
            layout.rank()
        )));
    }
    if writable && !layout.flags.writable {
        return Err(ViewError::TypeMismatch(
            "array is not writable".to_string(),
        ));
    }

    let item_size = std::mem::size_of::<T>();
    if layout.flags.aligned && layout.dtype == target {
        if let Some(strides) = layout.element_strides(item_size) {
            log::debug!("binding {N}-d view of {target} without copy");
            let ptr = source.data_ptr();
            return Ok(snapshot(source, ptr, &layout.dims, &strides, false));
        }
    }

    if !host.can_cast(layout.dtype, target, casting) {
        return Err(ViewError::TypeMismatch(format!(
            "cannot cast array from {} to {target} with {casting} casting",
            layout.dtype
        )));
    }
    if writable && !host.can_cast(target, layout.dtype, casting) {
        return Err(ViewError::TypeMismatch(format!(
            "cannot cast {target} back to writable array of {} with {casting} casting",
            layout.dtype
        )));
    }

    log::debug!(
        "copying {N}-d array from {} to {target} (writable: {writable})",
        layout.dtype
    );
    let request = ConvertRequest {
        dtype: target,
        order: None,
        writable,
        write_back: writable,
    };
    let copy = HostArrayRef::from_owned(host, host.convert(source.handle(), &request)?);
    // The copy keeps its own reference to the source when it writes back.
    drop(source);

    let layout = copy.layout();
    let strides = match layout.element_strides(item_size) {
        Some(strides) if layout.rank() == N && layout.dtype == target && layout.flags.aligned => {
            strides
        }
        _ => {
            return Err(ViewError::Conversion(format!(
                "host conversion produced {} rank {} instead of aligned {target} rank {N}",
                layout.dtype,
                layout.rank()
            )))
        }
    };
    let ptr = copy.data_ptr();
    Ok(snapshot(copy, ptr, &layout.dims, &strides, true))
}

fn snapshot<'h, H: HostRuntime, const N: usize>(
    array: HostArrayRef<'h, H>,
    ptr: *mut u8,
    dims: &[usize],
    strides: &[isize],
    copied: bool,
) -> Bound<'h, H, N> {
    let mut shape = [0usize; N];
    shape.copy_from_slice(dims);
    let mut elem_strides = [0isize; N];
    elem_strides.copy_from_slice(strides);
    Bound {
        array,
        ptr,
        shape,
        strides: elem_strides,
        copied,
    }
}

/// Offset in elements of `indices` from the base pointer.
#[inline(always)]
fn element_offset<const N: usize>(strides: &[isize; N], indices: &[usize; N]) -> isize {
    let mut offset = 0isize;
    for k in 0..N {
        offset += strides[k] * indices[k] as isize;
    }
    offset
}

#[inline]
fn check_bounds<const N: usize>(shape: &[usize; N], indices: &[usize; N]) {
    for k in 0..N {
        assert!(
            indices[k] < shape[k],
            "index {} out of bounds for axis {k} with extent {}",
            indices[k],
            shape[k]
        );
    }
}

// ============================================================================
// HostView / HostViewMut
// ============================================================================

/// A read-only `N`-dimensional view of `T` over a host buffer.
///
/// # Type Parameters
/// - `'h`: Lifetime of the borrowed host runtime
/// - `H`: Host runtime owning the buffer
/// - `T`: Element type
/// - `N`: Number of dimensions (const generic)
///
/// # Example
/// ```rust
/// use strided_host::{CastingSafety, HostObject, HostView, MemoryHost, MemoryOrder};
///
/// let host = MemoryHost::new();
/// let id = host.from_fn::<i32>(&[4], MemoryOrder::RowMajor, |idx| idx[0] as i32);
/// // Widening i32 -> f64 is safe, so a converted copy is made.
/// let view = HostView::<_, f64, 1>::new(&host, &HostObject::Array(id), CastingSafety::Safe).unwrap();
/// assert!(view.is_copy());
/// assert_eq!(view.get([3]), 3.0);
/// ```
pub struct HostView<'h, H: HostRuntime, T: Element, const N: usize> {
    bound: Bound<'h, H, N>,
    _elem: PhantomData<&'h T>,
}

/// A writable `N`-dimensional view of `T` over a host buffer.
///
/// When binding needs a conversion copy, both directions of the cast are
/// checked and the copy writes its contents back into the original object
/// when the view is dropped.
pub struct HostViewMut<'h, H: HostRuntime, T: Element, const N: usize> {
    bound: Bound<'h, H, N>,
    _elem: PhantomData<&'h mut T>,
}

macro_rules! impl_view_common {
    ($view:ident) => {
        impl<'h, H: HostRuntime, T: Element, const N: usize> $view<'h, H, T, N> {
            /// Returns the size of each dimension.
            #[inline]
            pub fn shape(&self) -> &[usize; N] {
                &self.bound.shape
            }

            /// Returns the stride of each dimension, in elements.
            #[inline]
            pub fn strides(&self) -> &[isize; N] {
                &self.bound.strides
            }

            #[inline]
            pub fn dim(&self, axis: usize) -> usize {
                self.bound.shape[axis]
            }

            #[inline]
            pub fn stride(&self, axis: usize) -> isize {
                self.bound.strides[axis]
            }

            #[inline]
            pub fn ndim(&self) -> usize {
                N
            }

            /// Returns the total number of elements.
            #[inline]
            pub fn len(&self) -> usize {
                self.bound.shape.iter().product()
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.bound.shape.contains(&0)
            }

            /// Returns true if binding had to make a conversion copy.
            #[inline]
            pub fn is_copy(&self) -> bool {
                self.bound.copied
            }

            /// The host array the view is bound to (the copy, if one was made).
            #[inline]
            pub fn handle(&self) -> H::Array {
                self.bound.array.handle()
            }

            /// Pointer to the element at index zero.
            #[inline]
            pub fn as_ptr(&self) -> *const T {
                self.bound.ptr as *const T
            }

            /// Pointer to the element at `indices`, with no bounds check.
            ///
            /// # Safety
            /// Every index must be below the extent of its axis.
            #[inline(always)]
            pub unsafe fn ptr_at(&self, indices: [usize; N]) -> *const T {
                self.as_ptr()
                    .offset(element_offset(&self.bound.strides, &indices))
            }

            /// Get an element.
            ///
            /// # Panics
            /// Panics if an index is out of bounds.
            #[inline]
            pub fn get(&self, indices: [usize; N]) -> T {
                check_bounds(&self.bound.shape, &indices);
                unsafe { *self.ptr_at(indices) }
            }

            /// Get an element without bounds checking.
            ///
            /// # Safety
            /// Every index must be below the extent of its axis.
            #[inline(always)]
            pub unsafe fn get_unchecked(&self, indices: [usize; N]) -> T {
                *self.ptr_at(indices)
            }
        }

        impl<H: HostRuntime, T: Element> $view<'_, H, T, 2> {
            /// Number of rows.
            #[inline]
            pub fn nrows(&self) -> usize {
                self.bound.shape[0]
            }

            /// Number of columns.
            #[inline]
            pub fn ncols(&self) -> usize {
                self.bound.shape[1]
            }
        }

        impl<H: HostRuntime, T: Element, const N: usize> fmt::Debug for $view<'_, H, T, N> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($view))
                    .field("array", &self.bound.array)
                    .field("shape", &self.bound.shape)
                    .field("strides", &self.bound.strides)
                    .field("copied", &self.bound.copied)
                    .finish()
            }
        }
    };
}

impl_view_common!(HostView);
impl_view_common!(HostViewMut);

impl<'h, H: HostRuntime, T: Element, const N: usize> HostView<'h, H, T, N> {
    /// Bind a read-only view to `object`.
    ///
    /// With [`CastingSafety::No`] or [`CastingSafety::Equiv`] the object must
    /// already be an array of rank `N`; otherwise the host coerces it first.
    ///
    /// # Errors
    /// - [`ViewError::TypeMismatch`] if the rank differs, the object is not an
    ///   array under `No`/`Equiv`, or the cast is not permitted by `casting`
    /// - [`ViewError::Conversion`] if the host fails to coerce or copy
    pub fn new(host: &'h H, object: &H::Object, casting: CastingSafety) -> Result<Self> {
        Ok(Self {
            bound: bind::<H, T, N>(host, object, casting, false)?,
            _elem: PhantomData,
        })
    }
}

impl<'h, H: HostRuntime, T: Element, const N: usize> HostViewMut<'h, H, T, N> {
    /// Bind a writable view to `object`.
    ///
    /// Same rules as [`HostView::new`], plus the cast back from `T` to the
    /// source type must be permitted and the buffer must be writable.
    pub fn new(host: &'h H, object: &H::Object, casting: CastingSafety) -> Result<Self> {
        Ok(Self {
            bound: bind::<H, T, N>(host, object, casting, true)?,
            _elem: PhantomData,
        })
    }

    /// Mutable pointer to the element at index zero.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.bound.ptr as *mut T
    }

    /// Mutable pointer to the element at `indices`, with no bounds check.
    ///
    /// # Safety
    /// Every index must be below the extent of its axis.
    #[inline(always)]
    pub unsafe fn ptr_at_mut(&mut self, indices: [usize; N]) -> *mut T {
        let offset = element_offset(&self.bound.strides, &indices);
        self.as_mut_ptr().offset(offset)
    }

    /// Set an element.
    ///
    /// # Panics
    /// Panics if an index is out of bounds.
    #[inline]
    pub fn set(&mut self, indices: [usize; N], value: T) {
        check_bounds(&self.bound.shape, &indices);
        unsafe { *self.ptr_at_mut(indices) = value }
    }

    /// Get a mutable reference to an element.
    ///
    /// # Safety
    /// No other reference to this element, through another view, a
    /// negotiator binding or the host, may be used while the returned
    /// reference is alive.
    ///
    /// # Panics
    /// Panics if an index is out of bounds.
    #[inline]
    pub unsafe fn get_mut(&mut self, indices: [usize; N]) -> &mut T {
        check_bounds(&self.bound.shape, &indices);
        &mut *self.ptr_at_mut(indices)
    }

    /// Get a mutable reference to an element without bounds checking.
    ///
    /// # Safety
    /// Every index must be below the extent of its axis, and the exclusivity
    /// contract of [`get_mut`](Self::get_mut) applies.
    #[inline(always)]
    pub unsafe fn get_unchecked_mut(&mut self, indices: [usize; N]) -> &mut T {
        &mut *self.ptr_at_mut(indices)
    }
}
