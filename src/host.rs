//! The host array runtime seen from this crate, and scoped ownership of its arrays.
//!
//! A host runtime owns every buffer. This crate only ever holds references it
//! acquired itself, each wrapped in a [`HostArrayRef`] that releases it exactly
//! once when dropped, including on early-return error paths.

use crate::casting::CastingSafety;
use crate::element::DType;
use crate::layout::{ArrayLayout, MemoryOrder};
use std::fmt;

/// Diagnostic reported by a host runtime when one of its primitives fails.
///
/// The message is opaque to this crate and is carried into the
/// [`ViewError`](crate::ViewError) it causes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HostFailure {
    message: String,
}

impl HostFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Outcome of cheaply inspecting an input object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<A> {
    /// The object is already an array; carries one acquired reference.
    Array(A),
    /// The object describes array data (shape and dtype) that has not been
    /// materialized yet.
    Described { dtype: DType, dims: Vec<usize> },
}

/// Parameters of a conversion copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertRequest {
    pub dtype: DType,
    /// Dense order of the copy; `None` lets the host keep the source order.
    pub order: Option<MemoryOrder>,
    pub writable: bool,
    /// Propagate the copy's contents back into the source on final release.
    pub write_back: bool,
}

/// Primitives a host array runtime must provide.
///
/// Handles of type [`HostRuntime::Array`] are borrowed: copying one never
/// changes a reference count. Every handle returned by [`probe`],
/// [`coerce`], [`convert`] or [`allocate`] carries one reference that the
/// caller owns and must give back through [`release`].
///
/// [`probe`]: HostRuntime::probe
/// [`coerce`]: HostRuntime::coerce
/// [`convert`]: HostRuntime::convert
/// [`allocate`]: HostRuntime::allocate
/// [`release`]: HostRuntime::release
pub trait HostRuntime {
    /// Arbitrary input object, array-like or not.
    type Object: ?Sized;
    /// Borrowed handle to a host array.
    type Array: Copy + Eq + fmt::Debug;

    /// The object as an array, if it is one. No reference is acquired.
    fn as_array(&self, object: &Self::Object) -> Option<Self::Array>;

    fn layout(&self, array: Self::Array) -> ArrayLayout;

    /// Address of the element at index zero.
    fn data_ptr(&self, array: Self::Array) -> *mut u8;

    fn acquire(&self, array: Self::Array);

    /// Drop one reference. The last release of a write-back copy propagates
    /// its contents to the original first.
    fn release(&self, array: Self::Array);

    /// Must be monotonic in `casting`. Defaults to [`crate::can_cast`].
    fn can_cast(&self, from: DType, to: DType, casting: CastingSafety) -> bool {
        crate::casting::can_cast(from, to, casting)
    }

    /// Inspect `object` without copying its data.
    fn probe(&self, object: &Self::Object, writable: bool) -> Result<Probe<Self::Array>, HostFailure>;

    /// Turn `object` into an array of exactly `rank` dimensions, creating a
    /// new array if needed.
    fn coerce(
        &self,
        object: &Self::Object,
        rank: usize,
        writable: bool,
    ) -> Result<Self::Array, HostFailure>;

    /// Copy `array` into a new aligned, native array as described by `request`.
    fn convert(&self, array: Self::Array, request: &ConvertRequest) -> Result<Self::Array, HostFailure>;

    /// A new writable dense array.
    fn allocate(
        &self,
        dtype: DType,
        dims: &[usize],
        order: MemoryOrder,
    ) -> Result<Self::Array, HostFailure>;

    /// Copy the values described by `object` into `array`, casting as needed.
    fn fill_from_object(&self, array: Self::Array, object: &Self::Object) -> Result<(), HostFailure>;
}

/// One acquired reference to a host array, released on drop.
pub struct HostArrayRef<'h, H: HostRuntime + ?Sized> {
    host: &'h H,
    array: H::Array,
}

impl<'h, H: HostRuntime + ?Sized> HostArrayRef<'h, H> {
    /// Take ownership of a reference the caller already holds, such as one
    /// returned by [`HostRuntime::convert`].
    pub fn from_owned(host: &'h H, array: H::Array) -> Self {
        Self { host, array }
    }

    /// Acquire a new reference to a borrowed array.
    pub fn acquire(host: &'h H, array: H::Array) -> Self {
        log::trace!("acquire {array:?}");
        host.acquire(array);
        Self { host, array }
    }

    #[inline]
    pub fn handle(&self) -> H::Array {
        self.array
    }

    #[inline]
    pub fn host(&self) -> &'h H {
        self.host
    }

    #[inline]
    pub fn layout(&self) -> ArrayLayout {
        self.host.layout(self.array)
    }

    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        self.host.data_ptr(self.array)
    }
}

impl<H: HostRuntime + ?Sized> Drop for HostArrayRef<'_, H> {
    fn drop(&mut self) {
        log::trace!("release {:?}", self.array);
        self.host.release(self.array);
    }
}

impl<H: HostRuntime + ?Sized> fmt::Debug for HostArrayRef<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostArrayRef").field(&self.array).finish()
    }
}
