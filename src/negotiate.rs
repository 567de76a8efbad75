//! Single-shot layout and element type negotiation.
//!
//! A [`Negotiator`] is given one input object and then offered candidate
//! layouts, typically the specialized ones first with a strict casting level
//! and a general fallback last:
//!
//! ```rust
//! use strided_host::{CastingSafety, HostObject, MemoryHost, Negotiator, Scalar};
//!
//! let host = MemoryHost::new();
//! let points = HostObject::nested(&[2, 3], (0..6).map(|v| Scalar::Int(v)).collect());
//!
//! let mut negotiator = Negotiator::new(&host, &points, false).unwrap();
//! let matched = negotiator.try_2d::<f32>(0, 3, 1, 0, false, CastingSafety::Equiv).unwrap()
//!     || negotiator.try_2d::<f64>(0, 3, 1, 0, false, CastingSafety::SameKind).unwrap();
//! assert!(matched);
//! let values = negotiator.binding().unwrap().to_vec::<f64>().unwrap();
//! assert_eq!(values, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
//! ```
//!
//! A candidate that does not fit returns `Ok(false)` and leaves the
//! negotiator untouched. The first candidate that fits binds it for good;
//! any later `try_*` call is a usage error.
//!
//! A zero-copy binding shares memory with the host object and with anything
//! else bound to it, so the bound buffer is read and written by value
//! ([`Binding::to_vec`], [`Binding::copy_from_slice`]). Slices are only
//! handed out by the unsafe [`Binding::as_slice`] and
//! [`Binding::as_mut_slice`].

use crate::casting::CastingSafety;
use crate::element::{DType, Element, ElementType};
use crate::host::{ConvertRequest, HostArrayRef, HostRuntime, Probe};
use crate::layout::{is_contiguous, ArrayLayout, MemoryOrder};
use crate::{Result, ViewError};
use std::fmt;
use std::ptr;

/// Input not yet bound to a candidate.
enum Source<'h, H: HostRuntime> {
    /// Existing host array, one reference held.
    Array(HostArrayRef<'h, H>),
    /// Array-like object whose data has not been materialized.
    Deferred {
        object: &'h H::Object,
        dtype: DType,
        dims: Vec<usize>,
    },
}

/// How a candidate matched an existing array.
enum Matched<'h, H: HostRuntime> {
    /// The array itself fits.
    Borrow,
    /// A converted copy, one reference held.
    Copy(HostArrayRef<'h, H>),
}

/// The buffer a negotiator settled on.
///
/// The buffer is dense in [`Binding::memory_order`] and holds elements of
/// [`Binding::element_type`] in native byte order.
pub struct Binding<'h, H: HostRuntime> {
    array: HostArrayRef<'h, H>,
    element_type: ElementType,
    order: MemoryOrder,
    data: *mut u8,
    dims: Vec<usize>,
    strides: Vec<isize>,
    writable: bool,
    copied: bool,
}

impl<'h, H: HostRuntime> Binding<'h, H> {
    fn new(
        array: HostArrayRef<'h, H>,
        element_type: ElementType,
        order: MemoryOrder,
        writable: bool,
        copied: bool,
    ) -> Self {
        let layout = array.layout();
        let data = array.data_ptr();
        Self {
            array,
            element_type,
            order,
            data,
            dims: layout.dims,
            strides: layout.strides,
            writable,
            copied,
        }
    }

    /// Element type of the candidate that matched.
    #[inline]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    #[inline]
    pub fn memory_order(&self) -> MemoryOrder {
        self.order
    }

    /// Raw pointer to the first element.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns true if the bound buffer is a copy of the input.
    #[inline]
    pub fn is_copy(&self) -> bool {
        self.copied
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Per-axis strides in bytes.
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }

    /// The host array the negotiator is bound to.
    #[inline]
    pub fn handle(&self) -> H::Array {
        self.array.handle()
    }

    /// Copy the buffer out, in memory order.
    ///
    /// # Errors
    /// Returns [`ViewError::TypeMismatch`] if `T` is not equivalent to the
    /// bound element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_element::<T>()?;
        let len = self.len();
        let mut out = Vec::with_capacity(len);
        if len > 0 {
            unsafe {
                ptr::copy_nonoverlapping(self.data as *const T, out.as_mut_ptr(), len);
                out.set_len(len);
            }
        }
        Ok(out)
    }

    /// Overwrite the buffer with `values`, given in memory order.
    ///
    /// # Errors
    /// - [`ViewError::Usage`] if the negotiator was not created writable or
    ///   `values` does not have [`len`](Self::len) elements
    /// - [`ViewError::TypeMismatch`] if `T` does not match
    pub fn copy_from_slice<T: Element>(&mut self, values: &[T]) -> Result<()> {
        self.check_writable()?;
        self.check_element::<T>()?;
        if values.len() != self.len() {
            return Err(ViewError::Usage(format!(
                "binding holds {} elements, got {}",
                self.len(),
                values.len()
            )));
        }
        if !values.is_empty() {
            unsafe { ptr::copy_nonoverlapping(values.as_ptr(), self.data as *mut T, values.len()) };
        }
        Ok(())
    }

    /// The dense buffer as a slice in memory order.
    ///
    /// # Safety
    /// A zero-copy binding aliases the host array. While the slice is alive
    /// the buffer must not be written through any other binding, view or
    /// host call.
    ///
    /// # Errors
    /// Returns [`ViewError::TypeMismatch`] if `T` is not equivalent to the
    /// bound element type.
    pub unsafe fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_element::<T>()?;
        if self.is_empty() {
            return Ok(&[]);
        }
        Ok(std::slice::from_raw_parts(self.data as *const T, self.len()))
    }

    /// The dense buffer as a mutable slice in memory order.
    ///
    /// # Safety
    /// The slice must be the only access to the buffer while it is alive:
    /// no other binding, view or host call may read or write the same
    /// memory in the meantime.
    ///
    /// # Errors
    /// Returns [`ViewError::Usage`] if the negotiator was not created
    /// writable, and [`ViewError::TypeMismatch`] if `T` does not match.
    pub unsafe fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_writable()?;
        self.check_element::<T>()?;
        if self.is_empty() {
            return Ok(&mut []);
        }
        Ok(std::slice::from_raw_parts_mut(self.data as *mut T, self.len()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(ViewError::Usage(
                "mutable access to a binding that was not requested writable".to_string(),
            ))
        }
    }

    fn check_element<T: Element>(&self) -> Result<()> {
        if T::ELEMENT_TYPE.is_equivalent(self.element_type) {
            Ok(())
        } else {
            Err(ViewError::TypeMismatch(format!(
                "binding holds {} elements, not {}",
                self.element_type,
                T::ELEMENT_TYPE
            )))
        }
    }
}

impl<H: HostRuntime> fmt::Debug for Binding<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("array", &self.array)
            .field("element_type", &self.element_type)
            .field("order", &self.order)
            .field("dims", &self.dims)
            .field("writable", &self.writable)
            .field("copied", &self.copied)
            .finish()
    }
}

/// True if `dims` satisfies the extent constraints (0 = any).
fn dims_satisfy(dims: &[usize], wanted: &[usize]) -> bool {
    dims.len() == wanted.len()
        && dims
            .iter()
            .zip(wanted)
            .all(|(&have, &want)| want == 0 || have == want)
}

/// True if `layout` at `data` can be used directly as a dense `target`
/// buffer in `order`: native, equivalent element type, aligned, and with
/// exactly the dense strides.
fn is_dense(layout: &ArrayLayout, data: *mut u8, target: DType, order: MemoryOrder) -> bool {
    let align = target.element_type.alignment();
    layout.dtype.is_native()
        && layout.dtype.element_type.is_equivalent(target.element_type)
        && layout.flags.aligned
        && data as usize % align == 0
        && is_contiguous(&layout.dims, &layout.strides, layout.dtype.size(), order)
}

/// Check an array the host produced for a candidate before binding it.
fn check_host_output<H: HostRuntime>(
    array: &HostArrayRef<'_, H>,
    dims: &[usize],
    target: DType,
    order: MemoryOrder,
) -> Result<()> {
    let layout = array.layout();
    if layout.dims == dims && is_dense(&layout, array.data_ptr(), target, order) {
        return Ok(());
    }
    Err(ViewError::Conversion(format!(
        "host returned a {} array of shape {:?} with byte strides {:?}, expected a dense \
         aligned {order:?} {target} array of shape {dims:?}",
        layout.dtype, layout.dims, layout.strides
    )))
}

/// Stateful matcher binding one input object to the first fitting candidate.
///
/// States: unbound, then bound (terminal). A candidate that does not fit
/// returns `Ok(false)` with no state change.
pub struct Negotiator<'h, H: HostRuntime> {
    host: &'h H,
    writable: bool,
    // Declared before `source` so a copy is released (and written back)
    // while the original is still referenced.
    binding: Option<Binding<'h, H>>,
    /// `None` once bound.
    source: Option<Source<'h, H>>,
}

impl<'h, H: HostRuntime> Negotiator<'h, H> {
    /// Start negotiating over `object`.
    ///
    /// Set `writable` to make writes through the bound buffer reach the
    /// original object, either directly or by write-back from a copy.
    ///
    /// # Errors
    /// Returns [`ViewError::Conversion`] if the host cannot describe the
    /// object, or if `writable` is requested for an object that cannot be
    /// written to.
    pub fn new(host: &'h H, object: &'h H::Object, writable: bool) -> Result<Self> {
        let source = match host.probe(object, writable)? {
            Probe::Array(array) => Source::Array(HostArrayRef::from_owned(host, array)),
            Probe::Described { dtype, dims } => Source::Deferred {
                object,
                dtype,
                dims,
            },
        };
        Ok(Self {
            host,
            writable,
            binding: None,
            source: Some(source),
        })
    }

    /// Try a rank-1 candidate of element type `T`.
    ///
    /// `dim0` is an exact extent, or 0 for no constraint. The `casting` level
    /// bounds which conversions may be made to fit.
    ///
    /// # Errors
    /// - [`ViewError::Usage`] if a previous `try_*` already succeeded
    /// - [`ViewError::Conversion`] if the host fails to copy or materialize,
    ///   or returns an array that is not a dense buffer of the candidate
    pub fn try_1d<T: Element>(&mut self, dim0: usize, casting: CastingSafety) -> Result<bool> {
        let source = self.take_source("try_1d")?;
        self.offer::<T>(source, &[dim0], MemoryOrder::RowMajor, true, casting)
    }

    /// Try a rank-2 candidate of element type `T`.
    ///
    /// `(dim0, dim1)` are exact extents, 0 meaning unconstrained; `(0, 3)`
    /// asks for a list of 3-vectors. `(axis0, axis1)` orders the axes from
    /// smallest to largest memory stride: `(1, 0)` is row-major, `(0, 1)`
    /// is column-major.
    ///
    /// If an existing buffer has the other axis order, a reordering copy is
    /// only made when `allow_axis_conversion` is set. This is for callers
    /// that have both row-major and column-major kernels and want the one
    /// that avoids a copy.
    ///
    /// # Errors
    /// - [`ViewError::Usage`] if a previous `try_*` already succeeded or the
    ///   axes are not a permutation of `{0, 1}`
    /// - [`ViewError::Conversion`] if the host fails to copy or materialize,
    ///   or returns an array that is not a dense buffer of the candidate
    pub fn try_2d<T: Element>(
        &mut self,
        dim0: usize,
        dim1: usize,
        axis0: usize,
        axis1: usize,
        allow_axis_conversion: bool,
        casting: CastingSafety,
    ) -> Result<bool> {
        let source = self.take_source("try_2d")?;
        let Some(order) = MemoryOrder::from_axis_order(axis0, axis1) else {
            self.source = Some(source);
            return Err(ViewError::Usage(format!(
                "invalid axis ordering ({axis0}, {axis1}) for try_2d, expected (1, 0) or (0, 1)"
            )));
        };
        self.offer::<T>(source, &[dim0, dim1], order, allow_axis_conversion, casting)
    }

    /// Returns true once a candidate has matched.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    #[inline]
    pub fn binding(&self) -> Option<&Binding<'h, H>> {
        self.binding.as_ref()
    }

    #[inline]
    pub fn binding_mut(&mut self) -> Option<&mut Binding<'h, H>> {
        self.binding.as_mut()
    }

    /// Element type of the bound buffer, once bound.
    pub fn element_type(&self) -> Option<ElementType> {
        self.binding.as_ref().map(Binding::element_type)
    }

    /// Pointer to the bound buffer, once bound.
    pub fn data_ptr(&self) -> Option<*mut u8> {
        self.binding.as_ref().map(Binding::as_ptr)
    }

    /// Whether writability was requested.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether binding made a copy. False while unbound.
    pub fn is_copy(&self) -> bool {
        self.binding.as_ref().is_some_and(Binding::is_copy)
    }

    /// The unbound input, which every path that does not bind puts back.
    fn take_source(&mut self, call: &str) -> Result<Source<'h, H>> {
        self.source.take().ok_or_else(|| {
            ViewError::Usage(format!("called {call} after another try_* succeeded"))
        })
    }

    fn offer<T: Element>(
        &mut self,
        source: Source<'h, H>,
        wanted: &[usize],
        order: MemoryOrder,
        allow_reorder: bool,
        casting: CastingSafety,
    ) -> Result<bool> {
        let target = DType::of::<T>();
        match source {
            Source::Array(array) => {
                let outcome = self.match_existing(&array, wanted, target, order, allow_reorder, casting);
                match outcome {
                    // The probe reference becomes the binding's.
                    Ok(Some(Matched::Borrow)) => self.bind::<T>(array, order, false),
                    // The copy holds the original itself where write-back needs it.
                    Ok(Some(Matched::Copy(copy))) => {
                        drop(array);
                        self.bind::<T>(copy, order, true)
                    }
                    outcome => {
                        self.source = Some(Source::Array(array));
                        outcome.map(|_| false)
                    }
                }
            }
            Source::Deferred {
                object,
                dtype,
                dims,
            } => {
                let outcome = self.match_deferred(object, dtype, &dims, wanted, target, order, casting);
                match outcome {
                    Ok(Some(array)) => self.bind::<T>(array, order, true),
                    outcome => {
                        self.source = Some(Source::Deferred {
                            object,
                            dtype,
                            dims,
                        });
                        outcome.map(|_| false)
                    }
                }
            }
        }
    }

    fn bind<T: Element>(
        &mut self,
        array: HostArrayRef<'h, H>,
        order: MemoryOrder,
        copied: bool,
    ) -> Result<bool> {
        self.binding = Some(Binding::new(
            array,
            T::ELEMENT_TYPE,
            order,
            self.writable,
            copied,
        ));
        Ok(true)
    }

    /// Candidate against an existing buffer.
    fn match_existing(
        &self,
        array: &HostArrayRef<'h, H>,
        wanted: &[usize],
        target: DType,
        order: MemoryOrder,
        allow_reorder: bool,
        casting: CastingSafety,
    ) -> Result<Option<Matched<'h, H>>> {
        let layout = array.layout();
        if !dims_satisfy(&layout.dims, wanted) {
            return Ok(None);
        }
        if is_dense(&layout, array.data_ptr(), target, order) {
            log::debug!("bound {:?} {target} buffer without copy", layout.dims);
            return Ok(Some(Matched::Borrow));
        }
        if !layout.is_contiguous_in(order) && !allow_reorder {
            log::debug!("rejected {target} candidate: buffer is not {order:?}");
            return Ok(None);
        }
        if !self.host.can_cast(layout.dtype, target, casting)
            || (self.writable && !self.host.can_cast(target, layout.dtype, casting))
        {
            log::debug!(
                "rejected {target} candidate: cannot cast {} with {casting} casting",
                layout.dtype
            );
            return Ok(None);
        }

        log::debug!("copying {:?} {} buffer to {order:?} {target}", layout.dims, layout.dtype);
        let request = ConvertRequest {
            dtype: target,
            order: Some(order),
            writable: self.writable,
            write_back: self.writable,
        };
        let copy = HostArrayRef::from_owned(self.host, self.host.convert(array.handle(), &request)?);
        check_host_output(&copy, &layout.dims, target, order)?;
        Ok(Some(Matched::Copy(copy)))
    }

    /// Candidate against a not yet materialized object: allocate the target
    /// array in the requested order and let the host fill it.
    #[allow(clippy::too_many_arguments)]
    fn match_deferred(
        &self,
        object: &H::Object,
        dtype: DType,
        dims: &[usize],
        wanted: &[usize],
        target: DType,
        order: MemoryOrder,
        casting: CastingSafety,
    ) -> Result<Option<HostArrayRef<'h, H>>> {
        if !dims_satisfy(dims, wanted) {
            return Ok(None);
        }
        if !self.host.can_cast(dtype, target, casting) {
            log::debug!("rejected {target} candidate: cannot cast {dtype} with {casting} casting");
            return Ok(None);
        }
        log::debug!("materializing {dims:?} {dtype} object as {order:?} {target}");
        let array = HostArrayRef::from_owned(self.host, self.host.allocate(target, dims, order)?);
        check_host_output(&array, dims, target, order)?;
        self.host.fill_from_object(array.handle(), object)?;
        Ok(Some(array))
    }
}

impl<H: HostRuntime> fmt::Debug for Negotiator<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("writable", &self.writable)
            .field("binding", &self.binding)
            .finish()
    }
}

#[cfg(all(test, feature = "memory-host"))]
mod tests {
    use super::*;
    use crate::memory::{HostObject, MemoryHost, Scalar};
    use crate::{ByteOrder, ErrorKind};

    fn f64_matrix(host: &MemoryHost, rows: usize, cols: usize, order: MemoryOrder) -> HostObject {
        HostObject::Array(host.from_fn::<f64>(&[rows, cols], order, |idx| {
            (idx[0] * cols + idx[1]) as f64
        }))
    }

    #[test]
    fn test_rank_mismatch_rejects_without_state_change() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 3, 5, MemoryOrder::RowMajor);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(!neg.try_1d::<f64>(3, CastingSafety::Unsafe).unwrap());
        assert!(!neg.is_bound());
        assert!(neg.try_2d::<f64>(3, 5, 1, 0, false, CastingSafety::No).unwrap());
    }

    #[test]
    fn test_extent_constraint() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 3, 5, MemoryOrder::RowMajor);
        let base = host.data_ptr(obj.as_array_id().unwrap());
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(!neg.try_2d::<f64>(0, 4, 1, 0, false, CastingSafety::SameKind).unwrap());
        assert!(neg.try_2d::<f64>(0, 5, 1, 0, false, CastingSafety::SameKind).unwrap());
        assert!(!neg.is_copy());
        assert_eq!(neg.data_ptr(), Some(base));
        assert_eq!(neg.element_type(), Some(ElementType::F64));
        assert_eq!(host.copy_count(), 0);
    }

    #[test]
    fn test_second_try_is_usage_error() {
        let host = MemoryHost::new();
        let id = host.from_fn::<i32>(&[4], MemoryOrder::RowMajor, |idx| idx[0] as i32);
        let obj = HostObject::Array(id);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(neg.try_1d::<i32>(0, CastingSafety::No).unwrap());
        let err = neg.try_1d::<i32>(0, CastingSafety::No).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = neg.try_2d::<f64>(1, 1, 1, 0, true, CastingSafety::Unsafe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_invalid_axis_order_is_usage_error() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 2, 2, MemoryOrder::RowMajor);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        for (a0, a1) in [(0, 0), (1, 1), (2, 0)] {
            let err = neg.try_2d::<f64>(0, 0, a0, a1, true, CastingSafety::No).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
        assert!(!neg.is_bound());
    }

    #[test]
    fn test_type_mismatch_rejects_then_fallback_copies() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 2, 3, MemoryOrder::RowMajor);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(!neg.try_2d::<f32>(0, 0, 1, 0, false, CastingSafety::Safe).unwrap());
        assert!(neg.try_2d::<f32>(0, 0, 1, 0, false, CastingSafety::SameKind).unwrap());
        assert!(neg.is_copy());
        let values = neg.binding().unwrap().to_vec::<f32>().unwrap();
        assert_eq!(values, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_axis_mismatch_without_conversion_rejects() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 2, 3, MemoryOrder::RowMajor);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(!neg.try_2d::<f64>(0, 0, 0, 1, false, CastingSafety::Unsafe).unwrap());
        assert_eq!(host.copy_count(), 0);
        assert!(!neg.is_bound());
    }

    #[test]
    fn test_axis_conversion_copies_into_requested_order() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 2, 3, MemoryOrder::RowMajor);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(neg.try_2d::<f64>(0, 0, 0, 1, true, CastingSafety::No).unwrap());
        let binding = neg.binding().unwrap();
        assert!(binding.is_copy());
        assert_eq!(binding.memory_order(), MemoryOrder::ColumnMajor);
        assert_eq!(binding.strides(), &[8, 16]);
        let values = binding.to_vec::<f64>().unwrap();
        assert_eq!(values, [0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_equivalent_element_type_binds_without_copy() {
        let host = MemoryHost::new();
        let id = host.from_fn::<isize>(&[3], MemoryOrder::RowMajor, |idx| idx[0] as isize);
        let obj = HostObject::Array(id);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        #[cfg(target_pointer_width = "64")]
        {
            assert!(neg.try_1d::<i64>(3, CastingSafety::No).unwrap());
            assert!(!neg.is_copy());
            assert_eq!(neg.binding().unwrap().to_vec::<i64>().unwrap(), [0, 1, 2]);
        }
        #[cfg(target_pointer_width = "32")]
        {
            assert!(neg.try_1d::<i32>(3, CastingSafety::No).unwrap());
            assert!(!neg.is_copy());
        }
    }

    #[test]
    fn test_byte_swapped_buffer_is_copied() {
        let host = MemoryHost::new();
        let id = host
            .array(ElementType::I32, &[3])
            .byte_order(ByteOrder::SWAPPED)
            .build_with(|idx| Scalar::Int(idx[0] as i128 + 7));
        let obj = HostObject::Array(id);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(!neg.try_1d::<i32>(0, CastingSafety::No).unwrap());
        assert!(neg.try_1d::<i32>(0, CastingSafety::Equiv).unwrap());
        assert!(neg.is_copy());
        assert_eq!(neg.binding().unwrap().to_vec::<i32>().unwrap(), [7, 8, 9]);
    }

    #[test]
    fn test_deferred_object_is_materialized_in_requested_order() {
        let host = MemoryHost::new();
        let obj = HostObject::nested(
            &[2, 2],
            vec![Scalar::Int(1), Scalar::Int(2), Scalar::Int(3), Scalar::Int(4)],
        );
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert_eq!(host.live_arrays(), 0);
        assert!(!neg.try_2d::<i8>(0, 0, 0, 1, false, CastingSafety::Safe).unwrap());
        assert!(neg.try_2d::<i32>(0, 0, 0, 1, false, CastingSafety::SameKind).unwrap());
        let binding = neg.binding().unwrap();
        assert!(binding.is_copy());
        assert_eq!(binding.memory_order(), MemoryOrder::ColumnMajor);
        assert_eq!(binding.to_vec::<i32>().unwrap(), [1, 3, 2, 4]);
        assert_eq!(host.live_arrays(), 1);
        drop(neg);
        assert_eq!(host.live_arrays(), 0);
    }

    #[test]
    fn test_writable_non_array_is_rejected_at_construction() {
        let host = MemoryHost::new();
        let obj = HostObject::nested(&[1], vec![Scalar::Float(1.0)]);
        let err = Negotiator::new(&host, &obj, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn test_writable_copy_requires_reverse_cast() {
        let host = MemoryHost::new();
        let id = host.from_fn::<f32>(&[3], MemoryOrder::RowMajor, |idx| idx[0] as f32);
        let obj = HostObject::Array(id);
        let mut neg = Negotiator::new(&host, &obj, true).unwrap();
        assert!(!neg.try_1d::<f64>(0, CastingSafety::Safe).unwrap());
        assert!(neg.try_1d::<f64>(0, CastingSafety::SameKind).unwrap());
        assert!(neg.is_writable());
    }

    #[test]
    fn test_read_only_binding_refuses_mutable_slice() {
        let host = MemoryHost::new();
        let id = host.from_fn::<f64>(&[2], MemoryOrder::RowMajor, |idx| idx[0] as f64);
        let obj = HostObject::Array(id);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert!(neg.try_1d::<f64>(0, CastingSafety::No).unwrap());
        let binding = neg.binding_mut().unwrap();
        let err = binding.copy_from_slice(&[1.0f64, 2.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(unsafe { binding.as_mut_slice::<f64>() }.unwrap_err().kind(), ErrorKind::Usage);
        assert_eq!(binding.to_vec::<f32>().unwrap_err().kind(), ErrorKind::TypeMismatch);
        assert_eq!(host.get(id, &[1]), Scalar::Float(1.0));
    }

    #[test]
    fn test_copy_failure_keeps_negotiator_usable() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 2, 2, MemoryOrder::RowMajor);
        let id = obj.as_array_id().unwrap();
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        host.fail_next_copy();
        let err = neg.try_2d::<f32>(0, 0, 1, 0, false, CastingSafety::SameKind).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        assert!(!neg.is_bound());
        assert_eq!(host.ref_count(id), 2);
        assert!(neg.try_2d::<f64>(0, 0, 1, 0, false, CastingSafety::No).unwrap());
        drop(neg);
        assert_eq!(host.ref_count(id), 1);
        assert_eq!(host.live_arrays(), 1);
    }

    #[test]
    fn test_copy_bind_drops_probe_reference() {
        let host = MemoryHost::new();
        let obj = f64_matrix(&host, 2, 2, MemoryOrder::RowMajor);
        let id = obj.as_array_id().unwrap();
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        assert_eq!(host.ref_count(id), 2);
        assert!(neg.try_2d::<f32>(0, 0, 1, 0, false, CastingSafety::SameKind).unwrap());
        assert_eq!(host.ref_count(id), 1);
        drop(neg);
        assert_eq!(host.live_arrays(), 1);
    }

    #[test]
    fn test_two_writable_bindings_share_by_value() {
        let host = MemoryHost::new();
        let id = host.from_fn::<f64>(&[3], MemoryOrder::RowMajor, |idx| idx[0] as f64);
        let obj = HostObject::Array(id);
        let mut a = Negotiator::new(&host, &obj, true).unwrap();
        let mut b = Negotiator::new(&host, &obj, true).unwrap();
        assert!(a.try_1d::<f64>(3, CastingSafety::No).unwrap());
        assert!(b.try_1d::<f64>(3, CastingSafety::No).unwrap());
        assert!(!a.is_copy() && !b.is_copy());
        assert_eq!(a.data_ptr(), b.data_ptr());

        a.binding_mut().unwrap().copy_from_slice(&[5.0, 6.0, 7.0]).unwrap();
        assert_eq!(b.binding().unwrap().to_vec::<f64>().unwrap(), [5.0, 6.0, 7.0]);
        unsafe { b.binding_mut().unwrap().as_mut_slice::<f64>().unwrap()[0] = -1.0 };
        assert_eq!(a.binding().unwrap().to_vec::<f64>().unwrap(), [-1.0, 6.0, 7.0]);

        let err = a.binding_mut().unwrap().copy_from_slice(&[1.0, 2.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        drop((a, b));
        assert_eq!(host.ref_count(id), 1);
        assert_eq!(host.get(id, &[1]), Scalar::Float(6.0));
    }

    /// Delegates to a [`MemoryHost`] but hands back copies that are not
    /// dense buffers of the requested type.
    struct PaddedCopies(MemoryHost);

    impl HostRuntime for PaddedCopies {
        type Object = HostObject;
        type Array = crate::memory::ArrayId;

        fn as_array(&self, object: &HostObject) -> Option<Self::Array> {
            self.0.as_array(object)
        }

        fn layout(&self, array: Self::Array) -> ArrayLayout {
            self.0.layout(array)
        }

        fn data_ptr(&self, array: Self::Array) -> *mut u8 {
            self.0.data_ptr(array)
        }

        fn acquire(&self, array: Self::Array) {
            self.0.acquire(array)
        }

        fn release(&self, array: Self::Array) {
            self.0.release(array)
        }

        fn probe(
            &self,
            object: &HostObject,
            writable: bool,
        ) -> std::result::Result<Probe<Self::Array>, crate::HostFailure> {
            self.0.probe(object, writable)
        }

        fn coerce(
            &self,
            object: &HostObject,
            rank: usize,
            writable: bool,
        ) -> std::result::Result<Self::Array, crate::HostFailure> {
            self.0.coerce(object, rank, writable)
        }

        fn convert(
            &self,
            array: Self::Array,
            request: &ConvertRequest,
        ) -> std::result::Result<Self::Array, crate::HostFailure> {
            let dims = self.0.layout(array).dims;
            let item = request.dtype.size() as isize;
            let padded = self
                .0
                .array(request.dtype.element_type, &dims)
                .byte_strides(&[item * (dims[1] as isize + 1), item])
                .build();
            Ok(padded)
        }

        fn allocate(
            &self,
            dtype: DType,
            dims: &[usize],
            _order: MemoryOrder,
        ) -> std::result::Result<Self::Array, crate::HostFailure> {
            Ok(self.0.array(dtype.element_type, dims).misaligned().build())
        }

        fn fill_from_object(
            &self,
            array: Self::Array,
            object: &HostObject,
        ) -> std::result::Result<(), crate::HostFailure> {
            self.0.fill_from_object(array, object)
        }
    }

    #[test]
    fn test_host_copy_that_is_not_dense_is_rejected() {
        let host = PaddedCopies(MemoryHost::new());
        let obj = f64_matrix(&host.0, 2, 3, MemoryOrder::RowMajor);
        let id = obj.as_array_id().unwrap();
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();

        let err = neg.try_2d::<f32>(0, 0, 1, 0, false, CastingSafety::SameKind).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        assert!(!neg.is_bound());
        assert_eq!(host.0.live_arrays(), 1);
        assert_eq!(host.0.ref_count(id), 2);

        assert!(neg.try_2d::<f64>(0, 0, 1, 0, false, CastingSafety::No).unwrap());
        assert!(!neg.is_copy());
        assert_eq!(neg.binding().unwrap().to_vec::<f64>().unwrap()[5], 5.0);
        drop(neg);
        assert_eq!(host.0.ref_count(id), 1);
    }

    #[test]
    fn test_host_allocation_that_is_misaligned_is_rejected() {
        let host = PaddedCopies(MemoryHost::new());
        let obj = HostObject::nested(&[2], vec![Scalar::Float(1.0), Scalar::Float(2.0)]);
        let mut neg = Negotiator::new(&host, &obj, false).unwrap();
        let err = neg.try_1d::<f64>(0, CastingSafety::Safe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        assert!(!neg.is_bound());
        assert_eq!(host.0.live_arrays(), 0);
        // The input is still offered to later candidates.
        let err = neg.try_1d::<f32>(0, CastingSafety::SameKind).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        assert!(!neg.try_1d::<f64>(3, CastingSafety::Safe).unwrap());
    }
}
