//! Typed strided views and layout negotiation over arrays owned by a host runtime.
//!
//! A host runtime (an embedding interpreter, a foreign array library, or the
//! in-process [`MemoryHost`]) owns buffers and knows how to describe, convert
//! and copy them. This crate sits on top of the [`HostRuntime`] trait and
//! decides, for a given input object, whether its buffer can be used as is or
//! whether a safety-checked conversion copy has to be made.
//!
//! # Core Types
//!
//! - [`HostView`] / [`HostViewMut`]: Fixed-rank, element-strided views bound once
//!   to a host buffer, copying only when the layout or element type does not fit
//! - [`Negotiator`]: Single-shot matcher that tries candidate ranks, extents,
//!   axis orders and element types in turn and binds to the first that fits
//! - [`CastingSafety`] / [`can_cast`]: Monotonic lattice of permitted conversions
//! - [`Element`]: Compile-time mapping from Rust scalars to [`ElementType`] tags
//!
//! # Ownership
//!
//! Every reference this crate acquires lives in a [`HostArrayRef`] and is
//! released exactly once, on success and on every error path.
//!
//! # Example
//!
//! ```rust
//! use strided_host::{CastingSafety, HostObject, HostView, MemoryHost, MemoryOrder};
//!
//! let host = MemoryHost::new();
//! let id = host.from_fn::<f64>(&[2, 3], MemoryOrder::RowMajor, |idx| (idx[0] * 3 + idx[1]) as f64);
//! let object = HostObject::Array(id);
//!
//! let view = HostView::<_, f64, 2>::new(&host, &object, CastingSafety::Safe).unwrap();
//! assert!(!view.is_copy());
//! assert_eq!(view.shape(), &[2, 3]);
//! assert_eq!(view.get([1, 2]), 5.0);
//! ```
//!
//! # Negotiation Example
//!
//! ```rust
//! use strided_host::{CastingSafety, HostObject, MemoryHost, MemoryOrder, Negotiator};
//!
//! let host = MemoryHost::new();
//! let id = host.from_fn::<f64>(&[3, 5], MemoryOrder::RowMajor, |idx| idx[1] as f64);
//! let object = HostObject::Array(id);
//!
//! let mut negotiator = Negotiator::new(&host, &object, false).unwrap();
//! // Prefer a single-precision column-major kernel, fall back to row-major f64.
//! assert!(!negotiator.try_2d::<f32>(0, 5, 0, 1, false, CastingSafety::Equiv).unwrap());
//! assert!(negotiator.try_2d::<f64>(0, 5, 1, 0, false, CastingSafety::SameKind).unwrap());
//! assert!(!negotiator.is_copy());
//! ```

pub mod casting;
pub mod element;
pub mod host;
pub mod layout;
#[cfg(feature = "memory-host")]
pub mod memory;
pub mod negotiate;
pub mod view;

// ============================================================================
// Element types and casting
// ============================================================================
pub use casting::{can_cast, CastingSafety, ParseCastingError};
pub use element::{ByteOrder, DType, Element, ElementKind, ElementType};

// ============================================================================
// Host runtime
// ============================================================================
pub use host::{ConvertRequest, HostArrayRef, HostFailure, HostRuntime, Probe};
pub use layout::{ArrayFlags, ArrayLayout, MemoryOrder};

// ============================================================================
// Views and negotiation
// ============================================================================
pub use negotiate::{Binding, Negotiator};
pub use view::{HostView, HostViewMut};

#[cfg(feature = "memory-host")]
pub use memory::{ArrayBuilder, ArrayId, HostObject, MemoryHost, Scalar};

// ============================================================================
// Error types
// ============================================================================

/// Category of a [`ViewError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The input cannot be presented with the requested type or rank.
    TypeMismatch,
    /// The caller broke an API contract. Never use this for control flow.
    Usage,
    /// The host runtime failed to coerce, materialize or copy.
    Conversion,
}

/// Errors that can occur while binding a view or negotiating a layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    /// Rank, element type or casting check failed.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// API misuse, such as a second `try_*` after a successful one.
    #[error("usage error: {0}")]
    Usage(String),

    /// A host primitive failed; carries the host's diagnostic.
    #[error("conversion failed: {0}")]
    Conversion(String),
}

impl ViewError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ViewError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            ViewError::Usage(_) => ErrorKind::Usage,
            ViewError::Conversion(_) => ErrorKind::Conversion,
        }
    }
}

impl From<HostFailure> for ViewError {
    fn from(failure: HostFailure) -> Self {
        ViewError::Conversion(failure.message().to_string())
    }
}

/// Result type for view and negotiation operations.
pub type Result<T> = std::result::Result<T, ViewError>;
