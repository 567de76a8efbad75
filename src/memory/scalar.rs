//! Dynamically typed element values.

use crate::element::{DType, ElementType};
use bytemuck::Pod;
use num_complex::{Complex, Complex64};
use num_traits::AsPrimitive;

/// One element value, independent of how it is stored.
///
/// Storing a scalar into a narrower type follows `as`-cast semantics:
/// integers wrap, floats saturate towards the integer range, complex values
/// lose their imaginary part when stored as real numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i128),
    Float(f64),
    Complex(Complex64),
}

impl Scalar {
    /// The element type a nested sequence of this scalar materializes as.
    pub fn default_element_type(&self) -> ElementType {
        match self {
            Scalar::Bool(_) => ElementType::Bool,
            Scalar::Int(_) => ElementType::I64,
            Scalar::Float(_) => ElementType::F64,
            Scalar::Complex(_) => ElementType::C128,
        }
    }

    /// Smallest default element type that holds every value, `f64` if empty.
    pub fn infer_element_type(values: &[Scalar]) -> ElementType {
        values
            .iter()
            .map(Scalar::default_element_type)
            .max_by_key(|t| t.kind())
            .unwrap_or(ElementType::F64)
    }

    fn is_truthy(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(v) => v != 0,
            Scalar::Float(v) => v != 0.0,
            Scalar::Complex(c) => c.re != 0.0 || c.im != 0.0,
        }
    }

    fn real<T>(self) -> T
    where
        T: Copy + 'static,
        i128: AsPrimitive<T>,
        f64: AsPrimitive<T>,
    {
        match self {
            Scalar::Bool(b) => i128::from(b).as_(),
            Scalar::Int(v) => v.as_(),
            Scalar::Float(v) => v.as_(),
            Scalar::Complex(c) => c.re.as_(),
        }
    }

    fn complex(self) -> Complex64 {
        match self {
            Scalar::Complex(c) => c,
            other => Complex64::new(other.real::<f64>(), 0.0),
        }
    }

    /// Read one element stored as `dtype`.
    pub(crate) fn decode(bytes: &[u8], dtype: DType) -> Scalar {
        let size = dtype.size();
        let mut buf = [0u8; 16];
        buf[..size].copy_from_slice(&bytes[..size]);
        if !dtype.is_native() {
            swap_units(&mut buf[..size], dtype.element_type.swap_unit());
        }
        let b = &buf[..size];
        match dtype.element_type {
            ElementType::Bool => Scalar::Bool(b[0] != 0),
            ElementType::I8 => Scalar::Int(take::<i8>(b).as_()),
            ElementType::U8 => Scalar::Int(take::<u8>(b).as_()),
            ElementType::I16 => Scalar::Int(take::<i16>(b).as_()),
            ElementType::U16 => Scalar::Int(take::<u16>(b).as_()),
            ElementType::I32 => Scalar::Int(take::<i32>(b).as_()),
            ElementType::U32 => Scalar::Int(take::<u32>(b).as_()),
            ElementType::I64 => Scalar::Int(take::<i64>(b).as_()),
            ElementType::U64 => Scalar::Int(take::<u64>(b).as_()),
            ElementType::ISize => Scalar::Int(take::<isize>(b).as_()),
            ElementType::USize => Scalar::Int(take::<usize>(b).as_()),
            ElementType::F32 => Scalar::Float(take::<f32>(b).into()),
            ElementType::F64 => Scalar::Float(take::<f64>(b)),
            ElementType::C64 => {
                let c = take::<Complex<f32>>(b);
                Scalar::Complex(Complex64::new(c.re.into(), c.im.into()))
            }
            ElementType::C128 => Scalar::Complex(take::<Complex64>(b)),
        }
    }

    /// Write this value as one element of `dtype` into `out`.
    pub(crate) fn encode(self, dtype: DType, out: &mut [u8]) {
        let out = &mut out[..dtype.size()];
        match dtype.element_type {
            ElementType::Bool => out[0] = u8::from(self.is_truthy()),
            ElementType::I8 => put(out, self.real::<i8>()),
            ElementType::U8 => put(out, self.real::<u8>()),
            ElementType::I16 => put(out, self.real::<i16>()),
            ElementType::U16 => put(out, self.real::<u16>()),
            ElementType::I32 => put(out, self.real::<i32>()),
            ElementType::U32 => put(out, self.real::<u32>()),
            ElementType::I64 => put(out, self.real::<i64>()),
            ElementType::U64 => put(out, self.real::<u64>()),
            ElementType::ISize => put(out, self.real::<isize>()),
            ElementType::USize => put(out, self.real::<usize>()),
            ElementType::F32 => put(out, self.real::<f32>()),
            ElementType::F64 => put(out, self.real::<f64>()),
            ElementType::C64 => {
                let c = self.complex();
                put(out, Complex::<f32>::new(c.re as f32, c.im as f32))
            }
            ElementType::C128 => put(out, self.complex()),
        }
        if !dtype.is_native() {
            swap_units(out, dtype.element_type.swap_unit());
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v.into())
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<Complex64> for Scalar {
    fn from(v: Complex64) -> Self {
        Scalar::Complex(v)
    }
}

#[inline]
fn take<T: Pod>(bytes: &[u8]) -> T {
    bytemuck::pod_read_unaligned(bytes)
}

#[inline]
fn put<T: Pod>(out: &mut [u8], value: T) {
    out.copy_from_slice(bytemuck::bytes_of(&value));
}

fn swap_units(bytes: &mut [u8], unit: usize) {
    for chunk in bytes.chunks_exact_mut(unit) {
        chunk.reverse();
    }
}
