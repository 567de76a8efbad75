//! Element type tags and the compile-time mapping from Rust scalars to tags.
//!
//! A host runtime describes each buffer with a [`DType`]: an [`ElementType`]
//! tag plus the [`ByteOrder`] the values are stored in. Rust scalar types are
//! mapped to tags through the [`Element`] trait, so the mapping is resolved at
//! compile time and costs nothing at bind time.

use num_complex::Complex;
use std::fmt;

/// Broad category of an element type, ordered from least to most general.
///
/// The ordering is what same-kind casting compares: a cast is same-kind when
/// the source kind does not come after the target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementKind {
    Bool,
    Unsigned,
    Signed,
    Float,
    Complex,
}

/// Identifies one scalar representation understood by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ElementType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// Platform-width signed integer.
    ISize,
    /// Platform-width unsigned integer.
    USize,
    F32,
    F64,
    /// Complex number made of two `f32`.
    C64,
    /// Complex number made of two `f64`.
    C128,
}

impl ElementType {
    /// Every tag, in declaration order.
    pub const ALL: [ElementType; 15] = [
        ElementType::Bool,
        ElementType::I8,
        ElementType::U8,
        ElementType::I16,
        ElementType::U16,
        ElementType::I32,
        ElementType::U32,
        ElementType::I64,
        ElementType::U64,
        ElementType::ISize,
        ElementType::USize,
        ElementType::F32,
        ElementType::F64,
        ElementType::C64,
        ElementType::C128,
    ];

    /// Size of one element in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::C64 => 8,
            Self::ISize | Self::USize => std::mem::size_of::<usize>(),
            Self::C128 => 16,
        }
    }

    /// Required alignment of one element in bytes, that of the Rust type the
    /// tag maps to on this target.
    #[inline]
    pub const fn alignment(self) -> usize {
        use std::mem::align_of;
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 => align_of::<i16>(),
            Self::U16 => align_of::<u16>(),
            Self::I32 => align_of::<i32>(),
            Self::U32 => align_of::<u32>(),
            Self::I64 => align_of::<i64>(),
            Self::U64 => align_of::<u64>(),
            Self::ISize => align_of::<isize>(),
            Self::USize => align_of::<usize>(),
            Self::F32 | Self::C64 => align_of::<f32>(),
            Self::F64 | Self::C128 => align_of::<f64>(),
        }
    }

    #[inline]
    pub const fn kind(self) -> ElementKind {
        match self {
            Self::Bool => ElementKind::Bool,
            Self::U8 | Self::U16 | Self::U32 | Self::U64 | Self::USize => ElementKind::Unsigned,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::ISize => ElementKind::Signed,
            Self::F32 | Self::F64 => ElementKind::Float,
            Self::C64 | Self::C128 => ElementKind::Complex,
        }
    }

    /// Returns true when both tags describe byte-identical representations.
    ///
    /// Distinct tags can be equivalent: `ISize` is equivalent to `I64` on
    /// 64-bit targets and to `I32` on 32-bit targets.
    #[inline]
    pub fn is_equivalent(self, other: ElementType) -> bool {
        self.kind() == other.kind() && self.size() == other.size()
    }

    /// Size of the byte-swapped unit: the whole element for real types,
    /// each half for complex types.
    #[inline]
    pub(crate) const fn swap_unit(self) -> usize {
        match self.kind() {
            ElementKind::Complex => self.size() / 2,
            _ => self.size(),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::ISize => "isize",
            Self::USize => "usize",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::C64 => "c64",
            Self::C128 => "c128",
        };
        f.write_str(name)
    }
}

/// Byte order of stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    #[cfg(target_endian = "little")]
    pub const NATIVE: ByteOrder = ByteOrder::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: ByteOrder = ByteOrder::Big;

    /// The non-native order.
    pub const SWAPPED: ByteOrder = match Self::NATIVE {
        ByteOrder::Little => ByteOrder::Big,
        ByteOrder::Big => ByteOrder::Little,
    };

    #[inline]
    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }
}

/// Element type plus byte order: everything needed to interpret one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DType {
    pub element_type: ElementType,
    pub byte_order: ByteOrder,
}

impl DType {
    /// A native-order dtype. Single-byte types are always native.
    #[inline]
    pub const fn native(element_type: ElementType) -> Self {
        Self {
            element_type,
            byte_order: ByteOrder::NATIVE,
        }
    }

    /// A dtype with an explicit byte order, normalised so that single-byte
    /// types are always reported native.
    #[inline]
    pub fn with_byte_order(element_type: ElementType, byte_order: ByteOrder) -> Self {
        let byte_order = if element_type.size() == 1 {
            ByteOrder::NATIVE
        } else {
            byte_order
        };
        Self {
            element_type,
            byte_order,
        }
    }

    /// The dtype for a Rust element type.
    #[inline]
    pub const fn of<T: Element>() -> Self {
        Self::native(T::ELEMENT_TYPE)
    }

    #[inline]
    pub fn is_native(self) -> bool {
        self.byte_order.is_native()
    }

    #[inline]
    pub const fn size(self) -> usize {
        self.element_type.size()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.element_type.size() == 1 {
            return write!(f, "{}", self.element_type);
        }
        let mark = match self.byte_order {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
        };
        write!(f, "{mark}{}", self.element_type)
    }
}

/// Rust scalar types that can be viewed in a host buffer.
///
/// `bool` is deliberately absent: a host byte other than 0 or 1 would be an
/// invalid `bool`.
pub trait Element: bytemuck::Pod + fmt::Debug + 'static {
    /// Tag the host runtime uses for this type.
    const ELEMENT_TYPE: ElementType;
}

macro_rules! impl_element {
    ($($t:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const ELEMENT_TYPE: ElementType = ElementType::$tag;
            }
        )*
    };
}

impl_element!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    isize => ISize,
    usize => USize,
    f32 => F32,
    f64 => F64,
    Complex<f32> => C64,
    Complex<f64> => C128,
);
