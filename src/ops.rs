//! Operator registry and lowering strategies
//!
//! A strategy turns a binary operation over already-lowered operands into IR.
//! Scalar pairs become a typed expression; anything involving an array
//! becomes an elementwise loop nest writing into a buffer.

use std::collections::BTreeMap;

use tracing::debug;

use crate::ast::{BinOp, UnaryOp};
use crate::error::{CompileError, CompileResult};
use crate::ir::{self, BinaryOp, Buffer, PrimVar, Stmt};
use crate::resolver::{self, fmt_shape};
use crate::symbol::SymExpr;
use crate::types::{ArrayType, DType, KernelType};

/// A lowered expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Scalar { expr: ir::Expr, dtype: DType },
    Array(Buffer),
}

impl Value {
    pub fn scalar(expr: ir::Expr, dtype: DType) -> Self {
        Value::Scalar { expr, dtype }
    }

    pub fn ty(&self) -> KernelType {
        match self {
            Value::None => KernelType::None,
            Value::Scalar { dtype, .. } => KernelType::Scalar(*dtype),
            Value::Array(buffer) => KernelType::Array(buffer.ty.clone()),
        }
    }

    pub fn kind(&self) -> Option<OperandKind> {
        match self {
            Value::None => None,
            Value::Scalar { dtype, .. } => Some(OperandKind::Scalar(*dtype)),
            Value::Array(buffer) => Some(OperandKind::NDArray(buffer.dtype())),
        }
    }
}

/// Element kind of an operand, tagged with whether it is an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Scalar(DType),
    NDArray(DType),
}

impl OperandKind {
    pub fn dtype(&self) -> DType {
        match self {
            OperandKind::Scalar(dtype) | OperandKind::NDArray(dtype) => *dtype,
        }
    }

    fn class(&self) -> KindClass {
        match self {
            OperandKind::Scalar(_) => KindClass::Scalar,
            OperandKind::NDArray(_) => KindClass::NDArray,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum KindClass {
    Scalar,
    NDArray,
}

/// Inputs handed to a binary strategy
pub struct BinOpArgs<'a> {
    pub op: BinOp,
    pub lhs: &'a Value,
    pub rhs: &'a Value,
    /// Buffer the caller will store the result into, if any
    pub dest: Option<&'a Buffer>,
    pub lhs_ty: KernelType,
    pub rhs_ty: KernelType,
    pub line: usize,
}

pub type BinStrategy = fn(&mut Emitter<'_>, BinOpArgs<'_>) -> CompileResult<Value>;

pub type UnaryStrategy = fn(&mut Emitter<'_>, &Value, usize) -> CompileResult<Value>;

/// Sink for statements produced while lowering an expression
pub struct Emitter<'a> {
    out: &'a mut Vec<Stmt>,
    temps: &'a mut usize,
}

impl<'a> Emitter<'a> {
    pub fn new(out: &'a mut Vec<Stmt>, temps: &'a mut usize) -> Self {
        Self { out, temps }
    }

    pub fn emit(&mut self, stmt: Stmt) {
        self.out.push(stmt);
    }

    /// Allocate a fresh temporary buffer
    pub fn temp_buffer(&mut self, ty: ArrayType) -> Buffer {
        let buffer = Buffer::new(format!("__tmp{}", *self.temps), ty);
        *self.temps += 1;
        debug!(buffer = %buffer.name, ty = %buffer.ty, "allocate temporary");
        self.emit(Stmt::Allocate(buffer.clone()));
        buffer
    }

    /// Emit a loop nest over `shape`; `body` builds the innermost statement from the axis variables
    pub fn loop_nest(&mut self, shape: &[SymExpr], body: impl FnOnce(&[ir::Expr]) -> Stmt) {
        let axes: Vec<PrimVar> = (0..shape.len())
            .map(|axis| PrimVar::scalar(format!("__ax{}", axis), DType::Int64))
            .collect();
        let indices: Vec<ir::Expr> = axes.iter().map(ir::Expr::var).collect();

        let mut stmt = body(&indices);
        for (var, extent) in axes.into_iter().zip(shape).rev() {
            stmt = Stmt::For {
                var,
                start: ir::Expr::int(0),
                stop: resolver::sym_to_ir(extent),
                step: ir::Expr::int(1),
                body: Box::new(stmt),
            };
        }
        self.emit(stmt);
    }

    /// Copy `value` into every element of `dest`, broadcasting and casting
    pub fn materialize(&mut self, dest: &Buffer, value: &Value, line: usize) -> CompileResult<()> {
        match value {
            Value::None => Err(CompileError::type_error(
                line,
                format!("cannot assign None to array '{}'", dest.name),
            )),
            Value::Array(src) if src == dest => Ok(()),
            Value::Array(src) => {
                let shape = resolver::broadcast_shapes(&dest.ty.shape, &src.ty.shape, line)?;
                if shape != dest.ty.shape {
                    return Err(CompileError::shape_mismatch(
                        line,
                        fmt_shape(&dest.ty.shape),
                        fmt_shape(&src.ty.shape),
                    ));
                }
                let dtype = dest.dtype();
                self.loop_nest(&dest.ty.shape, |axes| Stmt::Store {
                    buffer: dest.name.clone(),
                    indices: axes.to_vec(),
                    value: broadcast_load(src, axes).cast(dtype),
                });
                Ok(())
            }
            Value::Scalar { expr, .. } => {
                let value = expr.clone().cast(dest.dtype());
                self.loop_nest(&dest.ty.shape, |axes| Stmt::Store {
                    buffer: dest.name.clone(),
                    indices: axes.to_vec(),
                    value,
                });
                Ok(())
            }
        }
    }
}

/// Load of `src` at the right-aligned position of the output `axes`; unit dims read index 0
fn broadcast_load(src: &Buffer, axes: &[ir::Expr]) -> ir::Expr {
    let offset = axes.len() - src.ty.ndim();
    let one = SymExpr::int(1);
    let indices = src
        .ty
        .shape
        .iter()
        .enumerate()
        .map(|(axis, dim)| {
            if *dim == one {
                ir::Expr::int(0)
            } else {
                axes[axis + offset].clone()
            }
        })
        .collect();
    ir::Expr::Load {
        buffer: src.name.clone(),
        indices,
        dtype: src.dtype(),
    }
}

/// Typed scalar `lhs op rhs`; both operands are cast to the computation kind
pub fn scalar_expr(
    op: BinOp,
    lhs: ir::Expr,
    lhs_dtype: DType,
    rhs: ir::Expr,
    rhs_dtype: DType,
    line: usize,
) -> CompileResult<(ir::Expr, DType)> {
    let dtype = resolver::result_dtype(op, lhs_dtype, rhs_dtype, line)?;
    let ir_op = BinaryOp::from_ast(op)
        .ok_or_else(|| CompileError::unsupported(line, format!("operator '{}' is not supported", op)))?;
    let expr = ir::Expr::binary(ir_op, lhs.cast(dtype), rhs.cast(dtype), dtype);
    Ok((expr, dtype))
}

fn scalar_binary(_emitter: &mut Emitter<'_>, args: BinOpArgs<'_>) -> CompileResult<Value> {
    let (Value::Scalar { expr: l, dtype: ld }, Value::Scalar { expr: r, dtype: rd }) = (args.lhs, args.rhs) else {
        return Err(CompileError::type_error(args.line, "scalar strategy applied to non-scalar operands"));
    };
    let (expr, dtype) = scalar_expr(args.op, l.clone(), *ld, r.clone(), *rd, args.line)?;
    Ok(Value::scalar(expr, dtype))
}

fn element(value: &Value, axes: &[ir::Expr]) -> Option<(ir::Expr, DType)> {
    match value {
        Value::Scalar { expr, dtype } => Some((expr.clone(), *dtype)),
        Value::Array(buffer) => Some((broadcast_load(buffer, axes), buffer.dtype())),
        Value::None => None,
    }
}

fn elementwise_binary(emitter: &mut Emitter<'_>, args: BinOpArgs<'_>) -> CompileResult<Value> {
    let KernelType::Array(result) = resolver::binary_result(args.op, &args.lhs_ty, &args.rhs_ty, args.line)? else {
        return Err(CompileError::type_error(args.line, "elementwise strategy applied to scalar operands"));
    };

    // Reuse the destination only when it has exactly the broadcast shape
    let out = match args.dest {
        Some(dest) if dest.ty.shape == result.shape => dest.clone(),
        _ => emitter.temp_buffer(result.clone()),
    };

    let axes: Vec<ir::Expr> = (0..result.ndim())
        .map(|axis| ir::Expr::var(&PrimVar::scalar(format!("__ax{}", axis), DType::Int64)))
        .collect();
    let (Some((l, ld)), Some((r, rd))) = (element(args.lhs, &axes), element(args.rhs, &axes)) else {
        return Err(CompileError::type_error(args.line, "None is not a valid operand"));
    };
    let (value, _) = scalar_expr(args.op, l, ld, r, rd, args.line)?;
    let value = value.cast(out.dtype());

    emitter.loop_nest(&result.shape, |indices| Stmt::Store {
        buffer: out.name.clone(),
        indices: indices.to_vec(),
        value,
    });
    Ok(Value::Array(out))
}

/// Strategies keyed by operand classes
pub struct OpRegistry {
    binary: BTreeMap<(KindClass, KindClass), BinStrategy>,
}

impl OpRegistry {
    pub fn new() -> Self {
        let mut binary: BTreeMap<(KindClass, KindClass), BinStrategy> = BTreeMap::new();
        binary.insert((KindClass::Scalar, KindClass::Scalar), scalar_binary);
        binary.insert((KindClass::Scalar, KindClass::NDArray), elementwise_binary);
        binary.insert((KindClass::NDArray, KindClass::Scalar), elementwise_binary);
        binary.insert((KindClass::NDArray, KindClass::NDArray), elementwise_binary);
        Self { binary }
    }

    /// Strategy for `lhs op rhs`; an operator with no rule for the element kinds is rejected here
    pub fn get_bin_operator(
        &self,
        lhs: OperandKind,
        rhs: OperandKind,
        op: BinOp,
        line: usize,
    ) -> CompileResult<BinStrategy> {
        resolver::result_dtype(op, lhs.dtype(), rhs.dtype(), line)?;
        self.binary
            .get(&(lhs.class(), rhs.class()))
            .copied()
            .ok_or_else(|| CompileError::unsupported(line, format!("no lowering for operator '{}'", op)))
    }

    /// Unary operators have no lowering
    pub fn get_unary_operator(&self, operand: OperandKind, op: UnaryOp, line: usize) -> CompileResult<UnaryStrategy> {
        Err(CompileError::unsupported(
            line,
            format!("unary operator {:?} on {} is not supported", op, operand.dtype()),
        ))
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn array(name: &str, dtype: DType, shape: Vec<SymExpr>) -> Value {
        Value::Array(Buffer::new(name, ArrayType::new(dtype, shape)))
    }

    fn run(op: BinOp, lhs: &Value, rhs: &Value, dest: Option<&Buffer>) -> (CompileResult<Value>, Vec<Stmt>) {
        let registry = OpRegistry::new();
        let (Some(lk), Some(rk)) = (lhs.kind(), rhs.kind()) else {
            panic!("operands must be typed");
        };
        let mut out = Vec::new();
        let mut temps = 0;
        let result = registry.get_bin_operator(lk, rk, op, 1).and_then(|strategy| {
            let mut emitter = Emitter::new(&mut out, &mut temps);
            strategy(
                &mut emitter,
                BinOpArgs {
                    op,
                    lhs,
                    rhs,
                    dest,
                    lhs_ty: lhs.ty(),
                    rhs_ty: rhs.ty(),
                    line: 1,
                },
            )
        });
        (result, out)
    }

    #[test]
    fn test_scalar_pair_is_expression() {
        let lhs = Value::scalar(ir::Expr::IntImm { value: 1, dtype: DType::Int32 }, DType::Int32);
        let rhs = Value::scalar(ir::Expr::int(2), DType::Int64);
        let (result, out) = run(BinOp::Add, &lhs, &rhs, None);

        assert!(out.is_empty());
        let Value::Scalar { expr, dtype } = result.unwrap() else {
            panic!("Expected scalar");
        };
        assert_eq!(dtype, DType::Int64);
        assert_eq!(expr.to_string(), "(1 + 2)");
    }

    #[test]
    fn test_array_operand_allocates_temp_loop_nest() {
        let n = SymExpr::symbol("N");
        let a = array("a", DType::Int32, vec![n.clone()]);
        let two = Value::scalar(ir::Expr::FloatImm { value: 2.0, dtype: DType::Float32 }, DType::Float32);
        let (result, out) = run(BinOp::Mult, &a, &two, None);

        let Value::Array(buffer) = result.unwrap() else {
            panic!("Expected array");
        };
        assert_eq!(buffer.name, "__tmp0");
        assert_eq!(buffer.ty, ArrayType::new(DType::Float32, vec![n]));
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[1].to_string(),
            "for __ax0 in range(0, N, 1):\n    __tmp0[__ax0] = (float32(a[__ax0]) * float32(2.0))\n"
        );
    }

    #[test]
    fn test_destination_reused_when_shape_matches() {
        let n = SymExpr::symbol("N");
        let a = array("a", DType::Int32, vec![n.clone()]);
        let b = array("b", DType::Int32, vec![SymExpr::int(1)]);
        let dest = Buffer::new("c", ArrayType::new(DType::Int32, vec![n]));
        let (result, out) = run(BinOp::Sub, &a, &b, Some(&dest));

        assert_eq!(result.unwrap(), Value::Array(dest));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_string(), "for __ax0 in range(0, N, 1):\n    c[__ax0] = (a[__ax0] - b[0])\n");
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = array("a", DType::Int32, vec![SymExpr::symbol("M")]);
        let b = array("b", DType::Int32, vec![SymExpr::symbol("N")]);
        let (result, _) = run(BinOp::Add, &a, &b, None);
        assert!(matches!(result, Err(CompileError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_rejected_operators() {
        let registry = OpRegistry::new();
        let float = OperandKind::NDArray(DType::Float32);
        assert!(registry.get_bin_operator(float, float, BinOp::BitXor, 1).is_err());
        assert!(registry.get_bin_operator(float, float, BinOp::MatMult, 1).is_err());
        assert!(matches!(
            registry.get_unary_operator(OperandKind::Scalar(DType::Int32), UnaryOp::USub, 1),
            Err(CompileError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_materialize_rejects_shape_mismatch() {
        let mut out = Vec::new();
        let mut temps = 0;
        let mut emitter = Emitter::new(&mut out, &mut temps);
        let dest = Buffer::new("d", ArrayType::new(DType::Int32, vec![SymExpr::symbol("M")]));
        let src = array("s", DType::Int32, vec![SymExpr::symbol("M"), SymExpr::symbol("N")]);

        assert!(matches!(
            emitter.materialize(&dest, &src, 4),
            Err(CompileError::ShapeMismatch { line: 4, .. })
        ));
    }
}
