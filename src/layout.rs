//! Shape, stride and contiguity bookkeeping for host arrays.
//!
//! Strides reported by a host are in bytes. Views convert them to element
//! units once, at bind time.

use crate::element::DType;

/// Dense memory order of a contiguous array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MemoryOrder {
    /// Last index varies fastest (C order).
    RowMajor,
    /// First index varies fastest (Fortran order).
    ColumnMajor,
}

impl MemoryOrder {
    /// Interpret a rank-2 axis permutation ordered from smallest to largest
    /// memory stride: `(1, 0)` is row-major, `(0, 1)` is column-major.
    pub fn from_axis_order(axis0: usize, axis1: usize) -> Option<MemoryOrder> {
        match (axis0, axis1) {
            (1, 0) => Some(MemoryOrder::RowMajor),
            (0, 1) => Some(MemoryOrder::ColumnMajor),
            _ => None,
        }
    }

    /// Element strides for a dense array of this order.
    pub fn strides(self, dims: &[usize]) -> Vec<isize> {
        match self {
            MemoryOrder::RowMajor => row_major_strides(dims),
            MemoryOrder::ColumnMajor => col_major_strides(dims),
        }
    }

    /// Byte strides for a dense array of this order.
    pub fn byte_strides(self, dims: &[usize], item_size: usize) -> Vec<isize> {
        self.strides(dims)
            .into_iter()
            .map(|s| s * item_size as isize)
            .collect()
    }
}

/// Compute column-major strides (first index varies fastest).
pub fn col_major_strides(dims: &[usize]) -> Vec<isize> {
    let rank = dims.len();
    if rank == 0 {
        return vec![];
    }
    let mut strides = vec![1isize; rank];
    for i in 1..rank {
        strides[i] = strides[i - 1] * dims[i - 1] as isize;
    }
    strides
}

/// Compute row-major strides (last index varies fastest).
pub fn row_major_strides(dims: &[usize]) -> Vec<isize> {
    let rank = dims.len();
    if rank == 0 {
        return vec![];
    }
    let mut strides = vec![1isize; rank];
    for i in (0..rank - 1).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as isize;
    }
    strides
}

/// Check whether byte strides describe a dense array in `order`.
///
/// Axes of extent 1 are ignored and empty arrays are contiguous in both
/// orders.
pub fn is_contiguous(dims: &[usize], strides: &[isize], item_size: usize, order: MemoryOrder) -> bool {
    if dims.contains(&0) {
        return true;
    }
    let mut expected = item_size as isize;
    let mut check = |d: usize, s: isize| {
        if d <= 1 {
            return true;
        }
        if s != expected {
            return false;
        }
        expected = expected.saturating_mul(d as isize);
        true
    };
    match order {
        MemoryOrder::RowMajor => dims
            .iter()
            .zip(strides.iter())
            .rev()
            .all(|(&d, &s)| check(d, s)),
        MemoryOrder::ColumnMajor => dims
            .iter()
            .zip(strides.iter())
            .all(|(&d, &s)| check(d, s)),
    }
}

/// Layout properties a host reports alongside the shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayFlags {
    /// Every element address is a multiple of the element alignment.
    pub aligned: bool,
    pub writable: bool,
    pub row_major: bool,
    pub column_major: bool,
}

impl ArrayFlags {
    #[inline]
    pub fn is_contiguous_in(&self, order: MemoryOrder) -> bool {
        match order {
            MemoryOrder::RowMajor => self.row_major,
            MemoryOrder::ColumnMajor => self.column_major,
        }
    }
}

/// Snapshot of a host array's introspectable layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLayout {
    pub dtype: DType,
    pub dims: Vec<usize>,
    /// Per-axis strides in bytes.
    pub strides: Vec<isize>,
    pub flags: ArrayFlags,
}

impl ArrayLayout {
    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }

    /// Dense in `order`, as reported by the host.
    #[inline]
    pub fn is_contiguous_in(&self, order: MemoryOrder) -> bool {
        self.flags.is_contiguous_in(order)
    }

    /// Strides converted to units of `item_size`, or `None` if any byte
    /// stride is not an exact multiple.
    pub fn element_strides(&self, item_size: usize) -> Option<Vec<isize>> {
        let item = item_size as isize;
        self.strides
            .iter()
            .map(|&s| (s % item == 0).then_some(s / item))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_and_col_major_strides() {
        assert_eq!(row_major_strides(&[3, 4, 5]), vec![20, 5, 1]);
        assert_eq!(col_major_strides(&[3, 4, 5]), vec![1, 3, 12]);
        assert!(row_major_strides(&[]).is_empty());
    }

    #[test]
    fn test_byte_strides() {
        assert_eq!(MemoryOrder::RowMajor.byte_strides(&[3, 5], 8), vec![40, 8]);
        assert_eq!(MemoryOrder::ColumnMajor.byte_strides(&[3, 5], 8), vec![8, 24]);
    }

    #[test]
    fn test_from_axis_order() {
        assert_eq!(MemoryOrder::from_axis_order(1, 0), Some(MemoryOrder::RowMajor));
        assert_eq!(MemoryOrder::from_axis_order(0, 1), Some(MemoryOrder::ColumnMajor));
        assert_eq!(MemoryOrder::from_axis_order(0, 0), None);
        assert_eq!(MemoryOrder::from_axis_order(1, 2), None);
    }

    #[test]
    fn test_is_contiguous() {
        let dims = [3, 5];
        assert!(is_contiguous(&dims, &[40, 8], 8, MemoryOrder::RowMajor));
        assert!(!is_contiguous(&dims, &[40, 8], 8, MemoryOrder::ColumnMajor));
        assert!(is_contiguous(&dims, &[8, 24], 8, MemoryOrder::ColumnMajor));
        // padded rows
        assert!(!is_contiguous(&dims, &[48, 8], 8, MemoryOrder::RowMajor));
    }

    #[test]
    fn test_is_contiguous_ignores_unit_axes() {
        // A single row is dense in both orders whatever its leading stride.
        assert!(is_contiguous(&[1, 4], &[999, 4], 4, MemoryOrder::RowMajor));
        assert!(is_contiguous(&[1, 4], &[999, 4], 4, MemoryOrder::ColumnMajor));
        assert!(is_contiguous(&[0, 4], &[7, 3], 4, MemoryOrder::RowMajor));
    }

    #[test]
    fn test_element_strides() {
        let layout = ArrayLayout {
            dtype: DType::native(crate::ElementType::F64),
            dims: vec![2, 3],
            strides: vec![24, 8],
            flags: ArrayFlags::default(),
        };
        assert_eq!(layout.element_strides(8), Some(vec![3, 1]));
        assert_eq!(layout.element_strides(16), None);
    }
}
