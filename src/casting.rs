//! Casting safety levels and the compatibility lattice between dtypes.

use crate::element::{DType, ElementKind, ElementType};
use std::fmt;
use std::str::FromStr;

/// How much a conversion may change values, from most to least restrictive.
///
/// The derived ordering follows permissiveness: `No < Equiv < Safe < SameKind < Unsafe`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CastingSafety {
    /// Identical representation and byte order only.
    No,
    /// Identical representation; byte order may differ.
    Equiv,
    /// No loss of precision or range.
    #[default]
    Safe,
    /// Precision may drop but the kind cannot move backwards (e.g. `f64` to `f32`).
    SameKind,
    /// Anything goes.
    Unsafe,
}

impl CastingSafety {
    pub const ALL: [CastingSafety; 5] = [
        CastingSafety::No,
        CastingSafety::Equiv,
        CastingSafety::Safe,
        CastingSafety::SameKind,
        CastingSafety::Unsafe,
    ];

    /// Conventional name, as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Equiv => "equiv",
            Self::Safe => "safe",
            Self::SameKind => "same_kind",
            Self::Unsafe => "unsafe",
        }
    }

    /// Returns true for the levels that never need a conversion copy of a
    /// native buffer.
    #[inline]
    pub fn is_representation_preserving(self) -> bool {
        self <= CastingSafety::Equiv
    }
}

impl fmt::Display for CastingSafety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown casting name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown casting level {0:?}, expected one of no, equiv, safe, same_kind, unsafe")]
pub struct ParseCastingError(String);

impl FromStr for CastingSafety {
    type Err = ParseCastingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "no" => Ok(Self::No),
            "equiv" => Ok(Self::Equiv),
            "safe" => Ok(Self::Safe),
            "same_kind" => Ok(Self::SameKind),
            "unsafe" => Ok(Self::Unsafe),
            other => Err(ParseCastingError(other.to_string())),
        }
    }
}

/// Decide whether `from` may be converted to `to` under `casting`.
///
/// True at one level implies true at every more permissive level.
pub fn can_cast(from: DType, to: DType, casting: CastingSafety) -> bool {
    match casting {
        CastingSafety::No => {
            from.element_type.is_equivalent(to.element_type) && from.byte_order == to.byte_order
        }
        CastingSafety::Equiv => from.element_type.is_equivalent(to.element_type),
        CastingSafety::Safe => is_safe(from.element_type, to.element_type),
        CastingSafety::SameKind => {
            is_safe(from.element_type, to.element_type)
                || from.element_type.kind() <= to.element_type.kind()
        }
        CastingSafety::Unsafe => true,
    }
}

/// Value-preserving conversions.
fn is_safe(from: ElementType, to: ElementType) -> bool {
    if from.is_equivalent(to) {
        return true;
    }
    let (fs, ts) = (from.size(), to.size());
    match (from.kind(), to.kind()) {
        (ElementKind::Bool, _) => true,
        (_, ElementKind::Bool) => false,
        (ElementKind::Unsigned, ElementKind::Unsigned) => ts >= fs,
        (ElementKind::Unsigned, ElementKind::Signed) => ts > fs,
        (ElementKind::Signed, ElementKind::Signed) => ts >= fs,
        (ElementKind::Signed, ElementKind::Unsigned) => false,
        (ElementKind::Unsigned | ElementKind::Signed, ElementKind::Float) => {
            float_holds_integer(fs, ts)
        }
        (ElementKind::Unsigned | ElementKind::Signed, ElementKind::Complex) => {
            float_holds_integer(fs, ts / 2)
        }
        (ElementKind::Float, ElementKind::Float) => ts >= fs,
        (ElementKind::Float, ElementKind::Complex) => ts / 2 >= fs,
        (ElementKind::Complex, ElementKind::Complex) => ts >= fs,
        (ElementKind::Float | ElementKind::Complex, _) => false,
    }
}

/// Integers up to 16 bits fit `f32`, anything wider needs `f64`.
fn float_holds_integer(int_size: usize, float_size: usize) -> bool {
    if int_size <= 2 {
        float_size >= 4
    } else {
        float_size >= 8
    }
}
