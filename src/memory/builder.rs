use super::{for_each_index, ArrayId, MemoryHost, Scalar, Slot};
use crate::element::{ByteOrder, DType, ElementType};
use crate::layout::MemoryOrder;

/// Builder for [`MemoryHost`] arrays with unusual layouts.
///
/// Defaults to a native, aligned, writable row-major array.
///
/// ```rust
/// use strided_host::{ByteOrder, ElementType, HostRuntime, MemoryHost, Scalar};
///
/// let host = MemoryHost::new();
/// let id = host
///     .array(ElementType::F32, &[4])
///     .byte_order(ByteOrder::Big)
///     .byte_strides(&[8])
///     .build_with(|idx| Scalar::Float(idx[0] as f64));
/// let layout = host.layout(id);
/// assert!(!layout.flags.row_major);
/// assert_eq!(host.get(id, &[3]), Scalar::Float(3.0));
/// ```
#[must_use]
pub struct ArrayBuilder<'a> {
    host: &'a MemoryHost,
    element_type: ElementType,
    byte_order: ByteOrder,
    dims: Vec<usize>,
    order: MemoryOrder,
    byte_strides: Option<Vec<isize>>,
    misaligned: bool,
    writable: bool,
}

impl<'a> ArrayBuilder<'a> {
    pub(super) fn new(host: &'a MemoryHost, element_type: ElementType, dims: &[usize]) -> Self {
        Self {
            host,
            element_type,
            byte_order: ByteOrder::NATIVE,
            dims: dims.to_vec(),
            order: MemoryOrder::RowMajor,
            byte_strides: None,
            misaligned: false,
            writable: true,
        }
    }

    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Dense order, ignored when explicit strides are given.
    pub fn order(mut self, order: MemoryOrder) -> Self {
        self.order = order;
        self
    }

    /// Explicit per-axis strides in bytes; may be negative or padded.
    ///
    /// # Panics
    /// [`build`](Self::build) panics if the number of strides differs from
    /// the rank.
    pub fn byte_strides(mut self, strides: &[isize]) -> Self {
        self.byte_strides = Some(strides.to_vec());
        self
    }

    /// Place element zero one byte past an aligned address.
    pub fn misaligned(mut self) -> Self {
        self.misaligned = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Create the array, filled from `f(index)`.
    pub fn build_with(self, mut f: impl FnMut(&[usize]) -> Scalar) -> ArrayId {
        let dtype = DType::with_byte_order(self.element_type, self.byte_order);
        let strides = match self.byte_strides {
            Some(strides) => {
                assert_eq!(strides.len(), self.dims.len(), "one stride per axis");
                strides
            }
            None => self.order.byte_strides(&self.dims, dtype.size()),
        };
        let slot = Slot::new(dtype, &self.dims, strides, usize::from(self.misaligned), self.writable);
        for_each_index(&self.dims, |idx| slot.write(idx, f(idx)));
        self.host.insert(slot)
    }

    /// Create a zero-filled array.
    pub fn build(self) -> ArrayId {
        self.build_with(|_| Scalar::Int(0))
    }
}
