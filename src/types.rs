//! Element kinds, array types and numeric promotion

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::{BinOp, Constant, Expr};
use crate::error::{CompileError, CompileResult};
use crate::symbol::SymExpr;

/// Element kind of a scalar or array
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl DType {
    pub fn from_name(name: &str) -> Option<Self> {
        let dtype = match name {
            "bool" | "bool_" => DType::Bool,
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" | "int" => DType::Int64,
            "uint8" => DType::UInt8,
            "uint16" => DType::UInt16,
            "uint32" => DType::UInt32,
            "uint64" => DType::UInt64,
            "float16" => DType::Float16,
            "float32" => DType::Float32,
            "float64" | "float" => DType::Float64,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            DType::Bool => 1,
            DType::Int8 | DType::UInt8 => 8,
            DType::Int16 | DType::UInt16 | DType::Float16 => 16,
            DType::Int32 | DType::UInt32 | DType::Float32 => 32,
            DType::Int64 | DType::UInt64 | DType::Float64 => 64,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, DType::Bool)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64)
    }

    /// Signed or unsigned integer
    pub fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    /// Integer or bool
    pub fn is_integral(&self) -> bool {
        self.is_int() || self.is_bool()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64)
    }

    fn signed_with_bits(bits: u32) -> DType {
        match bits {
            0..=8 => DType::Int8,
            9..=16 => DType::Int16,
            17..=32 => DType::Int32,
            _ => DType::Int64,
        }
    }

    fn unsigned_with_bits(bits: u32) -> DType {
        match bits {
            0..=8 => DType::UInt8,
            9..=16 => DType::UInt16,
            17..=32 => DType::UInt32,
            _ => DType::UInt64,
        }
    }

    fn float_with_bits(bits: u32) -> DType {
        match bits {
            0..=16 => DType::Float16,
            17..=32 => DType::Float32,
            _ => DType::Float64,
        }
    }

    /// Common type of two operands of an arithmetic operator
    ///
    /// bool+bool is int64; int+int keeps integers at the wider width (signed if
    /// either is signed); anything with a float is a float at least as wide as
    /// the widest float operand.
    pub fn promote(a: DType, b: DType) -> DType {
        match (a, b) {
            (DType::Bool, DType::Bool) => DType::Int64,
            (DType::Bool, other) | (other, DType::Bool) => other,
            (x, y) if x.is_float() || y.is_float() => {
                let bits = [x, y]
                    .iter()
                    .filter(|d| d.is_float())
                    .map(|d| d.bits())
                    .max()
                    .unwrap_or(64);
                DType::float_with_bits(bits)
            }
            (x, y) if x.is_signed() == y.is_signed() => {
                let bits = x.bits().max(y.bits());
                if x.is_signed() {
                    DType::signed_with_bits(bits)
                } else {
                    DType::unsigned_with_bits(bits)
                }
            }
            (x, y) => {
                let (signed, unsigned) = if x.is_signed() { (x, y) } else { (y, x) };
                let bits = if unsigned.bits() >= signed.bits() {
                    (unsigned.bits() * 2).min(64)
                } else {
                    signed.bits()
                };
                DType::signed_with_bits(bits)
            }
        }
    }

    /// Result of true division: always a float
    pub fn true_div(a: DType, b: DType) -> DType {
        let promoted = DType::promote(a, b);
        if promoted.is_float() {
            promoted
        } else {
            DType::Float64
        }
    }

    /// Element kind a literal constant lowers to
    pub fn of_literal(constant: &Constant) -> Option<DType> {
        match constant {
            Constant::Bool(_) => Some(DType::Bool),
            Constant::Int(_) => Some(DType::Int64),
            Constant::Float(_) => Some(DType::Float64),
            Constant::None | Constant::Str(_) => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// N-dimensional array type: element kind and symbolic shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayType {
    pub dtype: DType,
    pub shape: Vec<SymExpr>,
}

impl ArrayType {
    pub fn new(dtype: DType, shape: Vec<SymExpr>) -> Self {
        Self { dtype, shape }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            shape: self.shape.clone(),
        }
    }
}

impl fmt::Display for ArrayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

/// Semantic type of a kernel value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelType {
    None,
    Scalar(DType),
    Array(ArrayType),
}

impl KernelType {
    pub fn dtype(&self) -> Option<DType> {
        match self {
            KernelType::None => None,
            KernelType::Scalar(dtype) => Some(*dtype),
            KernelType::Array(ty) => Some(ty.dtype),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, KernelType::Array(_))
    }

    /// Parse a type annotation: `None`, `int32`, or `float32[M, 2 * N]`
    pub fn from_annotation(annotation: &Expr, line: usize) -> CompileResult<Self> {
        match annotation {
            Expr::Constant(Constant::None) => Ok(KernelType::None),
            Expr::Name(name) => Ok(KernelType::Scalar(dtype_named(name, line)?)),
            Expr::Subscript { value, indices } => {
                let Expr::Name(name) = value.as_ref() else {
                    return Err(CompileError::unsupported(
                        line,
                        format!("unsupported array annotation base {}", value.kind_name()),
                    ));
                };
                let dtype = dtype_named(name, line)?;
                let shape = indices
                    .iter()
                    .map(|dim| dim_from_ast(dim, line))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(KernelType::Array(ArrayType::new(dtype, shape)))
            }
            other => Err(CompileError::unsupported(
                line,
                format!("unsupported type annotation {}", other.kind_name()),
            )),
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelType::None => write!(f, "None"),
            KernelType::Scalar(dtype) => write!(f, "{}", dtype),
            KernelType::Array(ty) => write!(f, "{}", ty),
        }
    }
}

fn dtype_named(name: &str, line: usize) -> CompileResult<DType> {
    DType::from_name(name)
        .ok_or_else(|| CompileError::type_error(line, format!("unknown element type '{}'", name)))
}

/// Convert a shape dimension written in an annotation to a symbolic expression
pub fn dim_from_ast(expr: &Expr, line: usize) -> CompileResult<SymExpr> {
    match expr {
        Expr::Constant(Constant::Int(n)) if *n >= 0 => Ok(SymExpr::int(*n)),
        Expr::Constant(Constant::Int(n)) => Err(CompileError::type_error(
            line,
            format!("negative array dimension {}", n),
        )),
        Expr::Name(name) => Ok(SymExpr::symbol(name.clone())),
        Expr::BinOp { left, op, right } => {
            let lhs = dim_from_ast(left, line)?;
            let rhs = dim_from_ast(right, line)?;
            if matches!(op, BinOp::FloorDiv | BinOp::Mod) && rhs.as_const() == Some(0) {
                return Err(CompileError::type_error(line, "division by zero in array dimension"));
            }
            let combined = match op {
                BinOp::Add => lhs.add(&rhs),
                BinOp::Sub => lhs.sub(&rhs),
                BinOp::Mult => lhs.mul(&rhs),
                BinOp::FloorDiv => lhs.floor_div(&rhs),
                BinOp::Mod => lhs.floor_mod(&rhs),
                other => {
                    return Err(CompileError::unsupported(
                        line,
                        format!("operator '{}' in array dimension", other),
                    ))
                }
            };
            combined.ok_or_else(|| CompileError::type_error(line, "integer overflow in array dimension"))
        }
        other => Err(CompileError::unsupported(
            line,
            format!("unsupported array dimension {}", other.kind_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn annotation(text: &str) -> CompileResult<KernelType> {
        let expr = Parser::new(text).unwrap().parse_expr().unwrap();
        KernelType::from_annotation(&expr, 1)
    }

    #[test]
    fn test_promotion() {
        assert_eq!(DType::promote(DType::Int32, DType::Int64), DType::Int64);
        assert_eq!(DType::promote(DType::Int32, DType::Float32), DType::Float32);
        assert_eq!(DType::promote(DType::Float16, DType::Float64), DType::Float64);
        assert_eq!(DType::promote(DType::Bool, DType::Bool), DType::Int64);
        assert_eq!(DType::promote(DType::Bool, DType::UInt8), DType::UInt8);
        assert_eq!(DType::promote(DType::Int8, DType::UInt8), DType::Int16);
        assert_eq!(DType::promote(DType::Int64, DType::UInt64), DType::Int64);
        assert_eq!(DType::true_div(DType::Int32, DType::Int32), DType::Float64);
        assert_eq!(DType::true_div(DType::Int32, DType::Float32), DType::Float32);
    }

    #[test]
    fn test_array_annotation() {
        let ty = annotation("float32[2 * M, N]").unwrap();
        let KernelType::Array(array) = ty else {
            panic!("Expected array type");
        };
        assert_eq!(array.dtype, DType::Float32);
        assert_eq!(array.ndim(), 2);
        assert_eq!(array.to_string(), "float32[2*M, N]");
    }

    #[test]
    fn test_scalar_and_none_annotations() {
        assert_eq!(annotation("int32").unwrap(), KernelType::Scalar(DType::Int32));
        assert_eq!(annotation("None").unwrap(), KernelType::None);
    }

    #[test]
    fn test_bad_annotations() {
        assert!(matches!(annotation("complex64[N]"), Err(CompileError::TypeError { .. })));
        assert!(matches!(annotation("int32[N ** 2]"), Err(CompileError::UnsupportedConstruct { .. })));
        assert!(matches!(annotation("int32[N // 0]"), Err(CompileError::TypeError { .. })));
    }

    #[test]
    fn test_overflowing_dimension_is_a_type_error() {
        for text in ["int32[9223372036854775807 + 1]", "int32[M * 9223372036854775807 * 2]", "int32[M % 0]"] {
            let err = annotation(text).unwrap_err();
            assert!(matches!(err, CompileError::TypeError { .. }), "{}: {}", text, err);
        }
        let ty = annotation("int32[9223372036854775807 + M - M]").unwrap();
        assert_eq!(ty.to_string(), "int32[9223372036854775807]");
    }
}
