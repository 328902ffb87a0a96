//! Lowering engine: syntax tree to IR
//!
//! The engine walks one function definition top-down. Statements are pulled
//! from the innermost scope frame's worklist; every block (function body,
//! loop body, branch arm) gets its own frame. Expressions lower to a
//! [`Value`], pushing any statements they need (temporaries, elementwise
//! loop nests) into the enclosing block first.
//!
//! Dispatch is an exhaustive match over the syntax tree's closed node kinds.
//! Kinds the language parses but does not lower fail with
//! [`CompileError::UnsupportedConstruct`].

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::ast::{self, BoolOp, CmpOp, Constant, Expr, FunctionDef, Keyword, StmtKind};
use crate::config::ParserConfig;
use crate::error::{CompileError, CompileResult};
use crate::ir::{self, Buffer, CompareOp, IrType, LogicalOp, PrimVar, Span, Stmt, SymbolBinding};
use crate::ops::{BinOpArgs, Emitter, OpRegistry, Value};
use crate::resolver::{self, ir_to_sym, sym_to_ir};
use crate::scope::{Binding, Frame, FrameKind, ScopeContext, Scoped};
use crate::symbol::SymbolTable;
use crate::types::{ArrayType, DType, KernelType};

/// Name of the synthetic buffer array results are returned through
pub const RETURN_BUFFER: &str = "__return";

/// Signature facts of the kernel being lowered
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionContext {
    pub name: String,
    pub arg_names: Vec<String>,
    pub arg_types: BTreeMap<String, ArrayType>,
    pub return_type: KernelType,
    /// Set for every argument the body assigns to
    pub reassigned: BTreeMap<String, bool>,
}

impl FunctionContext {
    pub fn new(name: impl Into<String>, args: Vec<(String, ArrayType)>, return_type: KernelType) -> Self {
        let arg_names: Vec<String> = args.iter().map(|(name, _)| name.clone()).collect();
        let reassigned = arg_names.iter().map(|name| (name.clone(), false)).collect();
        Self {
            name: name.into(),
            arg_names,
            arg_types: args.into_iter().collect(),
            return_type,
            reassigned,
        }
    }

    pub fn is_arg(&self, name: &str) -> bool {
        self.arg_types.contains_key(name)
    }

    pub fn is_reassigned(&self, name: &str) -> bool {
        self.reassigned.get(name).copied().unwrap_or(false)
    }

    fn mark_reassigned(&mut self, name: &str) {
        if let Some(flag) = self.reassigned.get_mut(name) {
            *flag = true;
        }
    }
}

/// Declared return type and the buffer array results are written into
struct ReturnSlot {
    ty: KernelType,
    buffer: Option<Buffer>,
    used: bool,
}

impl ReturnSlot {
    fn new(ty: KernelType) -> Self {
        let buffer = match &ty {
            KernelType::Array(array) => Some(Buffer::new(RETURN_BUFFER, array.clone())),
            _ => None,
        };
        Self {
            ty,
            buffer,
            used: false,
        }
    }

    fn is_buffer(&self, buffer: &Buffer) -> bool {
        self.buffer.as_ref() == Some(buffer)
    }
}

/// Lowers one kernel function
pub struct LoweringEngine<'a> {
    config: &'a ParserConfig,
    symbols: &'a SymbolTable,
    registry: OpRegistry,
    scope: ScopeContext,
    ctx: FunctionContext,
    handles: Vec<PrimVar>,
    temps: usize,
    /// Per source name, how many shadowing declarations were renamed
    renames: BTreeMap<String, usize>,
}

impl Scoped for LoweringEngine<'_> {
    fn scope_mut(&mut self) -> &mut ScopeContext {
        &mut self.scope
    }
}

impl<'a> LoweringEngine<'a> {
    pub fn new(config: &'a ParserConfig, symbols: &'a SymbolTable, ctx: FunctionContext) -> Self {
        Self {
            config,
            symbols,
            registry: OpRegistry::new(),
            scope: ScopeContext::new(symbols.assumptions()),
            ctx,
            handles: Vec::new(),
            temps: 0,
            renames: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &FunctionContext {
        &self.ctx
    }

    pub fn into_context(self) -> FunctionContext {
        self.ctx
    }

    pub fn scope_depth(&self) -> usize {
        self.scope.depth()
    }

    /// Session handle of the innermost function being lowered
    pub fn active_handle(&self) -> Option<&PrimVar> {
        self.handles.last()
    }

    fn emitter<'s>(&'s mut self, out: &'s mut Vec<Stmt>) -> Emitter<'s> {
        Emitter::new(out, &mut self.temps)
    }

    /// Generated IR names start with `__`; source names may not
    fn check_reserved(&self, name: &str, line: usize) -> CompileResult<()> {
        if name.starts_with("__") || name == self.config.handle_name {
            return Err(CompileError::type_error(
                line,
                format!("'{}' is a reserved name", name),
            ));
        }
        Ok(())
    }

    /// IR name for a new binding of `name`, distinct from every visible one
    fn fresh_name(&mut self, name: &str) -> String {
        if self.scope.lookup(name).is_none() {
            return name.to_string();
        }
        let count = self.renames.entry(name.to_string()).or_insert(0);
        *count += 1;
        let renamed = format!("{}.{}", name, count);
        debug!(name, renamed = %renamed, "renaming shadowing declaration");
        renamed
    }

    /// Lower a function definition into an IR function
    pub fn lower_function(&mut self, def: &FunctionDef) -> CompileResult<ir::Function> {
        info!(function = %def.name, line = def.line, "lowering function");

        let mut params = Vec::with_capacity(self.ctx.arg_names.len() + 1);
        let mut buffers = Vec::with_capacity(self.ctx.arg_names.len());
        let mut frame = Frame::new(FrameKind::Function, &def.body);
        for name in &self.ctx.arg_names {
            self.check_reserved(name, def.line)?;
            let ty = self
                .ctx
                .arg_types
                .get(name)
                .cloned()
                .ok_or_else(|| CompileError::unresolved(def.line, name))?;
            let buffer = Buffer::new(name.clone(), ty);
            params.push(buffer.data.clone());
            buffers.push(buffer.clone());
            frame = frame.with_binding(name.clone(), Binding::Array(buffer));
        }
        let symbols = self.symbol_bindings(&buffers);

        let handle = PrimVar::new(self.config.handle_name.clone(), IrType::Handle);
        params.push(handle.clone());
        self.handles.push(handle);

        let mut ret = ReturnSlot::new(self.ctx.return_type.clone());
        let ends_in_return = matches!(def.body.last().map(|s| &s.kind), Some(StmtKind::Return { .. }));
        let result = self.with_scope(frame, |engine| {
            let mut stmts = engine.lower_block(&mut ret)?;
            if !ends_in_return {
                debug!(function = %def.name, "synthesizing trailing return");
                engine.lower_return(None, &mut ret, def.end_line, &mut stmts)?;
            }
            Ok(stmts)
        });
        self.handles.pop();
        let mut stmts = result?;

        if ret.used {
            if let Some(buffer) = &ret.buffer {
                stmts.insert(0, Stmt::Allocate(buffer.clone()));
            }
        }

        let first = self.config.first_line.saturating_sub(1);
        Ok(ir::Function {
            name: def.name.clone(),
            params,
            buffers,
            symbols,
            body: Stmt::seq(stmts),
            ret_type: self.ctx.return_type.clone(),
            span: Span {
                file: self.config.file_name.clone(),
                line: def.line + first,
                end_line: def.end_line + first,
            },
        })
    }

    /// First parameter axis each shape symbol can be read from
    fn symbol_bindings(&self, buffers: &[Buffer]) -> Vec<SymbolBinding> {
        let mut bindings = Vec::with_capacity(self.symbols.len());
        for symbol in self.symbols.names() {
            let found = buffers.iter().find_map(|buffer| {
                buffer
                    .ty
                    .shape
                    .iter()
                    .position(|dim| dim.as_symbol() == Some(symbol))
                    .map(|axis| SymbolBinding {
                        symbol: symbol.to_string(),
                        param: buffer.name.clone(),
                        axis,
                    })
            });
            match found {
                Some(binding) => bindings.push(binding),
                None => warn!(symbol, "shape symbol only appears inside compound dimensions"),
            }
        }
        bindings
    }

    /// Drain the innermost frame's worklist
    fn lower_block(&mut self, ret: &mut ReturnSlot) -> CompileResult<Vec<Stmt>> {
        let mut out = Vec::with_capacity(self.scope.remaining());
        while let Some(stmt) = self.scope.next_stmt() {
            self.lower_stmt(&stmt, ret, &mut out)?;
        }
        Ok(out)
    }

    fn lower_nested(
        &mut self,
        kind: FrameKind,
        body: &[ast::Stmt],
        bindings: Vec<(String, Binding)>,
        ret: &mut ReturnSlot,
    ) -> CompileResult<Stmt> {
        let frame = bindings
            .into_iter()
            .fold(Frame::new(kind, body), |frame, (name, binding)| frame.with_binding(name, binding));
        let stmts = self.with_scope(frame, |engine| engine.lower_block(ret))?;
        Ok(Stmt::seq(stmts))
    }

    fn lower_stmt(&mut self, stmt: &ast::Stmt, ret: &mut ReturnSlot, out: &mut Vec<Stmt>) -> CompileResult<()> {
        let line = stmt.line;
        debug!(kind = stmt.kind.name(), line, "lower statement");

        match &stmt.kind {
            StmtKind::Assign { targets, value } => match targets.as_slice() {
                [target] => self.lower_assign(target, value, line, out),
                _ => Err(CompileError::unsupported(line, "multiple assignment targets are not supported")),
            },
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
            } => self.lower_declare(target, annotation, value.as_ref(), line, out),
            StmtKind::AugAssign { target, op, value } => {
                let combined = Expr::binop(target.clone(), *op, value.clone());
                self.lower_assign(target, &combined, line, out)
            }
            StmtKind::If { test, body, orelse } => self.lower_if(test, body, orelse, ret, line, out),
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => self.lower_for(target, iter, body, orelse, ret, line, out),
            StmtKind::Return { value } => self.lower_return(value.as_ref(), ret, line, out),
            // docstring
            StmtKind::Expr(Expr::Constant(Constant::Str(_))) => Ok(()),
            StmtKind::Expr(expr) => Err(CompileError::unsupported(
                line,
                format!("expression statement ({}) is not supported", expr.kind_name()),
            )),
            StmtKind::While { .. } => Err(CompileError::unsupported(line, "while loops are not supported")),
            StmtKind::FunctionDef(def) => Err(CompileError::unsupported(
                line,
                format!("nested function definition '{}' is not supported", def.name),
            )),
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => Err(CompileError::unsupported(
                line,
                format!("'{}' statements are not supported", stmt.kind.name().to_lowercase()),
            )),
        }
    }

    fn lower_assign(&mut self, target: &Expr, value: &Expr, line: usize, out: &mut Vec<Stmt>) -> CompileResult<()> {
        match target {
            Expr::Name(name) => {
                let binding = self
                    .scope
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| CompileError::undeclared_target(line, name))?;
                self.note_write(name);
                match binding {
                    Binding::Scalar { var, dtype, .. } => {
                        let value = self.lower_expr(value, None, out, line)?;
                        let (expr, _) = self.scalar_operand(value, line, "assignment to a scalar")?;
                        out.push(Stmt::Assign {
                            var,
                            value: expr.cast(dtype),
                        });
                        Ok(())
                    }
                    Binding::Array(buffer) => {
                        let value = self.lower_expr(value, Some(&buffer), out, line)?;
                        self.emitter(out).materialize(&buffer, &value, line)
                    }
                }
            }
            Expr::Subscript { value: base, indices } => {
                let Expr::Name(name) = base.as_ref() else {
                    return Err(CompileError::unsupported(
                        line,
                        format!("assignment into a subscripted {} is not supported", base.kind_name()),
                    ));
                };
                let buffer = match self.scope.lookup(name) {
                    None => return Err(CompileError::undeclared_target(line, name)),
                    Some(Binding::Scalar { .. }) => {
                        return Err(CompileError::type_error(line, format!("'{}' is not an array", name)))
                    }
                    Some(Binding::Array(buffer)) => buffer.clone(),
                };
                self.note_write(name);
                let indices = self.lower_indices(&buffer, indices, out, line)?;
                let value = self.lower_expr(value, None, out, line)?;
                let (expr, _) = self.scalar_operand(value, line, "element store")?;
                out.push(Stmt::Store {
                    buffer: buffer.name.clone(),
                    indices,
                    value: expr.cast(buffer.dtype()),
                });
                Ok(())
            }
            Expr::Attribute { value: base, attr } => {
                if let Expr::Name(name) = base.as_ref() {
                    if self.scope.lookup(name).is_none() && !self.symbols.contains(name) {
                        return Err(CompileError::undeclared_target(line, name));
                    }
                }
                Err(CompileError::unsupported(
                    line,
                    format!("assignment to attribute '{}' is not supported", attr),
                ))
            }
            other => Err(CompileError::unsupported(
                line,
                format!("cannot assign to {}", other.kind_name()),
            )),
        }
    }

    /// Record a write through `name` if it names an argument
    fn note_write(&mut self, name: &str) {
        if self.ctx.is_arg(name) && self.scope.binding_depth(name) == Some(0) {
            debug!(argument = name, "argument reassigned");
            self.ctx.mark_reassigned(name);
        }
    }

    fn lower_declare(
        &mut self,
        target: &Expr,
        annotation: &Expr,
        value: Option<&Expr>,
        line: usize,
        out: &mut Vec<Stmt>,
    ) -> CompileResult<()> {
        let Expr::Name(name) = target else {
            return Err(CompileError::unsupported(
                line,
                format!("cannot declare {}", target.kind_name()),
            ));
        };
        if self.symbols.contains(name) {
            return Err(CompileError::type_error(
                line,
                format!("'{}' is a shape symbol and cannot be redeclared", name),
            ));
        }
        self.check_reserved(name, line)?;

        let ty = KernelType::from_annotation(annotation, line)?;
        if let KernelType::Array(array) = &ty {
            for dim in &array.shape {
                if let Some(unknown) = dim.free_symbols().into_iter().find(|s| !self.symbols.contains(s)) {
                    return Err(CompileError::unresolved(line, unknown));
                }
            }
        }

        if let Some(existing) = self.scope.lookup_local(name) {
            let existing = existing.ty();
            if existing != ty {
                return Err(CompileError::type_error(
                    line,
                    format!("'{}' redeclared as {} but was declared as {}", name, ty, existing),
                ));
            }
            return match value {
                Some(value) => self.lower_assign(target, value, line, out),
                None => Ok(()),
            };
        }

        match ty {
            KernelType::None => Err(CompileError::type_error(
                line,
                format!("cannot declare '{}' with type None", name),
            )),
            KernelType::Scalar(dtype) => {
                let init = match value {
                    Some(value) => {
                        let value = self.lower_expr(value, None, out, line)?;
                        let (expr, _) = self.scalar_operand(value, line, "assignment to a scalar")?;
                        Some(expr.cast(dtype))
                    }
                    None => None,
                };
                let var = PrimVar::scalar(self.fresh_name(name), dtype);
                out.push(Stmt::Let {
                    var: var.clone(),
                    value: init,
                });
                self.scope.bind(name.clone(), Binding::scalar(var, dtype));
                Ok(())
            }
            KernelType::Array(array) => {
                let buffer = Buffer::new(self.fresh_name(name), array);
                out.push(Stmt::Allocate(buffer.clone()));
                if let Some(value) = value {
                    let value = self.lower_expr(value, Some(&buffer), out, line)?;
                    self.emitter(out).materialize(&buffer, &value, line)?;
                }
                self.scope.bind(name.clone(), Binding::Array(buffer));
                Ok(())
            }
        }
    }

    fn lower_if(
        &mut self,
        test: &Expr,
        body: &[ast::Stmt],
        orelse: &[ast::Stmt],
        ret: &mut ReturnSlot,
        line: usize,
        out: &mut Vec<Stmt>,
    ) -> CompileResult<()> {
        let cond = self.lower_expr(test, None, out, line)?;
        let (cond, _) = self.scalar_operand(cond, line, "truth value")?;

        let then_body = self.lower_nested(FrameKind::Branch, body, Vec::new(), ret)?;
        let else_body = if orelse.is_empty() {
            None
        } else {
            Some(Box::new(self.lower_nested(FrameKind::Branch, orelse, Vec::new(), ret)?))
        };

        out.push(Stmt::If {
            cond: cond.cast(DType::Bool),
            then_body: Box::new(then_body),
            else_body,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[ast::Stmt],
        orelse: &[ast::Stmt],
        ret: &mut ReturnSlot,
        line: usize,
        out: &mut Vec<Stmt>,
    ) -> CompileResult<()> {
        let Expr::Name(var_name) = target else {
            return Err(CompileError::unsupported(
                line,
                format!("for-loop target must be a name, got {}", target.kind_name()),
            ));
        };
        if !orelse.is_empty() {
            return Err(CompileError::unsupported(line, "for-else is not supported"));
        }
        if self.symbols.contains(var_name) {
            return Err(CompileError::type_error(
                line,
                format!("'{}' is a shape symbol and cannot be a loop variable", var_name),
            ));
        }
        self.check_reserved(var_name, line)?;
        let args = match iter {
            Expr::Call { func, args, keywords } if matches!(func.as_ref(), Expr::Name(n) if n == "range") => {
                if !keywords.is_empty() || args.is_empty() || args.len() > 3 {
                    return Err(CompileError::type_error(
                        line,
                        "range() expects 1 to 3 positional arguments",
                    ));
                }
                args
            }
            other => {
                return Err(CompileError::unsupported(
                    line,
                    format!("only range() loops are supported, got {}", other.kind_name()),
                ))
            }
        };

        let mut bounds = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.lower_expr(arg, None, out, line)?;
            bounds.push(self.integer_operand(value, line, "range() argument")?);
        }
        let mut bounds = bounds.into_iter();
        let (start, stop, step) = match (bounds.next(), bounds.next(), bounds.next()) {
            (Some(stop), None, None) => (ir::Expr::int(0), stop, ir::Expr::int(1)),
            (Some(start), Some(stop), None) => (start, stop, ir::Expr::int(1)),
            (Some(start), Some(stop), Some(step)) => (start, stop, step),
            _ => return Err(CompileError::type_error(line, "malformed range()")),
        };

        let step_sym = ir_to_sym(&step);
        if step_sym.as_ref().and_then(|s| s.as_const()) == Some(0) {
            return Err(CompileError::type_error(line, "range() step must not be zero"));
        }
        let asm = self.scope.assumptions();
        let nonneg = match (ir_to_sym(&start), ir_to_sym(&stop), step_sym) {
            (Some(first), Some(last), Some(step)) => {
                resolver::check_range(&first, &last, &step, &asm, line)?;
                first.is_nonneg(&asm) && step.is_positive(&asm)
            }
            (Some(first), _, Some(step)) => first.is_nonneg(&asm) && step.is_positive(&asm),
            _ => false,
        };

        let var = PrimVar::scalar(self.fresh_name(var_name), DType::Int64);
        let binding = Binding::Scalar {
            var: var.clone(),
            dtype: DType::Int64,
            nonneg,
        };
        let body = self.lower_nested(FrameKind::Loop, body, vec![(var_name.clone(), binding)], ret)?;
        out.push(Stmt::For {
            var,
            start,
            stop,
            step,
            body: Box::new(body),
        });
        Ok(())
    }

    fn lower_return(
        &mut self,
        value: Option<&Expr>,
        ret: &mut ReturnSlot,
        line: usize,
        out: &mut Vec<Stmt>,
    ) -> CompileResult<()> {
        let value = match value {
            Some(Expr::Tuple(_)) => {
                return Err(CompileError::unsupported(line, "returning tuple is not supported"));
            }
            Some(expr) => {
                let dest = ret.buffer.clone();
                self.lower_expr(expr, dest.as_ref(), out, line)?
            }
            None => Value::None,
        };

        let result = match (&ret.ty, value) {
            (KernelType::None, Value::None) => ir::Expr::NoneExpr,
            (KernelType::None, other) => {
                return Err(CompileError::type_error(
                    line,
                    format!("function declared to return None returns {}", other.ty()),
                ))
            }
            (KernelType::Scalar(dtype), Value::Scalar { expr, .. }) => expr.cast(*dtype),
            (KernelType::Scalar(dtype), other) => {
                return Err(CompileError::type_error(
                    line,
                    format!("function declared to return {} returns {}", dtype, other.ty()),
                ))
            }
            (KernelType::Array(expected), Value::Array(buffer)) if buffer.ty == *expected && !ret.is_buffer(&buffer) => {
                ir::Expr::var(&buffer.data)
            }
            (KernelType::Array(_), value) => {
                let Some(target) = ret.buffer.clone() else {
                    return Err(CompileError::type_error(line, "missing return buffer"));
                };
                ret.used = true;
                if value != Value::None {
                    self.emitter(out).materialize(&target, &value, line)?;
                }
                ir::Expr::var(&target.data)
            }
        };
        out.push(Stmt::Return(result));
        Ok(())
    }

    /// Lower an expression; `dest` is where the caller will store an array result
    fn lower_expr(
        &mut self,
        expr: &Expr,
        dest: Option<&Buffer>,
        out: &mut Vec<Stmt>,
        line: usize,
    ) -> CompileResult<Value> {
        debug!(kind = expr.kind_name(), line, "lower expression");

        match expr {
            Expr::Constant(constant) => self.lower_constant(constant, line),
            Expr::Name(name) => self.lower_name(name, line),
            Expr::Subscript { value, indices } => {
                let base = self.lower_expr(value, None, out, line)?;
                let Value::Array(buffer) = base else {
                    return Err(CompileError::type_error(
                        line,
                        format!("{} is not subscriptable", base.ty()),
                    ));
                };
                let indices = self.lower_indices(&buffer, indices, out, line)?;
                let dtype = buffer.dtype();
                Ok(Value::scalar(
                    ir::Expr::Load {
                        buffer: buffer.name,
                        indices,
                        dtype,
                    },
                    dtype,
                ))
            }
            Expr::BinOp { left, op, right } => {
                let lhs = self.lower_expr(left, None, out, line)?;
                let rhs = self.lower_expr(right, None, out, line)?;
                let (Some(lk), Some(rk)) = (lhs.kind(), rhs.kind()) else {
                    return Err(CompileError::type_error(
                        line,
                        format!("unsupported operand types for {}: {} and {}", op, lhs.ty(), rhs.ty()),
                    ));
                };
                let strategy = self.registry.get_bin_operator(lk, rk, *op, line)?;
                let args = BinOpArgs {
                    op: *op,
                    lhs: &lhs,
                    rhs: &rhs,
                    dest,
                    lhs_ty: lhs.ty(),
                    rhs_ty: rhs.ty(),
                    line,
                };
                strategy(&mut self.emitter(out), args)
            }
            Expr::UnaryOp { op, operand } => {
                let value = self.lower_expr(operand, None, out, line)?;
                let kind = value
                    .kind()
                    .ok_or_else(|| CompileError::type_error(line, "unary operator applied to None"))?;
                let strategy = self.registry.get_unary_operator(kind, *op, line)?;
                strategy(&mut self.emitter(out), &value, line)
            }
            Expr::Compare {
                left,
                ops,
                comparators,
            } => self.lower_compare(left, ops, comparators, out, line),
            Expr::BoolOp { op, values } => self.lower_boolop(*op, values, out, line),
            Expr::Call { func, args, keywords } => self.lower_call(func, args, keywords, out, line),
            Expr::Attribute { attr, .. } => Err(CompileError::unsupported(
                line,
                format!("attribute access '.{}' is not supported", attr),
            )),
            Expr::Slice { .. } => Err(CompileError::unsupported(line, "slicing is not supported")),
            Expr::Tuple(_) => Err(CompileError::unsupported(line, "tuple expressions are not supported")),
        }
    }

    fn lower_constant(&self, constant: &Constant, line: usize) -> CompileResult<Value> {
        match (constant, resolver::resolve_literal(constant, line)?) {
            (_, KernelType::None) => Ok(Value::None),
            (Constant::Bool(value), _) => Ok(Value::scalar(ir::Expr::BoolImm(*value), DType::Bool)),
            (Constant::Int(value), KernelType::Scalar(dtype)) => Ok(Value::scalar(
                ir::Expr::IntImm { value: *value, dtype },
                dtype,
            )),
            (Constant::Float(value), KernelType::Scalar(dtype)) => Ok(Value::scalar(
                ir::Expr::FloatImm { value: *value, dtype },
                dtype,
            )),
            (_, ty) => Err(CompileError::unsupported(
                line,
                format!("no lowering for a literal of type {}", ty),
            )),
        }
    }

    fn lower_name(&self, name: &str, line: usize) -> CompileResult<Value> {
        let ty = resolver::resolve_name(name, self.symbols, &self.scope, line)?;
        if self.symbols.contains(name) {
            return Ok(Value::scalar(ir::Expr::Symbol(name.to_string()), DType::Int64));
        }
        match self.scope.lookup(name) {
            Some(Binding::Scalar { var, dtype, .. }) => Ok(Value::scalar(ir::Expr::var(var), *dtype)),
            Some(Binding::Array(buffer)) => Ok(Value::Array(buffer.clone())),
            None => Err(CompileError::type_error(
                line,
                format!("'{}' resolved to {} but has no binding", name, ty),
            )),
        }
    }

    /// Full indexing of `buffer`, checked against its shape
    fn lower_indices(
        &mut self,
        buffer: &Buffer,
        indices: &[Expr],
        out: &mut Vec<Stmt>,
        line: usize,
    ) -> CompileResult<Vec<ir::Expr>> {
        let rank = buffer.ty.ndim();
        if indices.len() > rank {
            return Err(CompileError::type_error(
                line,
                format!("too many indices for '{}': {} given, rank is {}", buffer.name, indices.len(), rank),
            ));
        }
        if indices.len() < rank {
            return Err(CompileError::unsupported(
                line,
                format!("partial indexing of '{}' is not supported", buffer.name),
            ));
        }

        let asm = self.scope.assumptions();
        let mut lowered = Vec::with_capacity(rank);
        for (axis, index) in indices.iter().enumerate() {
            if let Expr::Slice { .. } = index {
                return Err(CompileError::unsupported(line, "slicing is not supported"));
            }
            let value = self.lower_expr(index, None, out, line)?;
            let expr = self.integer_operand(value, line, "array index")?;
            match ir_to_sym(&expr) {
                Some(sym) => {
                    resolver::check_index(&buffer.name, axis, &sym, &buffer.ty.shape[axis], &asm, line)?;
                    lowered.push(sym_to_ir(&sym));
                }
                None => lowered.push(expr),
            }
        }
        Ok(lowered)
    }

    fn lower_compare(
        &mut self,
        left: &Expr,
        ops: &[CmpOp],
        comparators: &[Expr],
        out: &mut Vec<Stmt>,
        line: usize,
    ) -> CompileResult<Value> {
        let mut operands = Vec::with_capacity(comparators.len() + 1);
        for operand in std::iter::once(left).chain(comparators) {
            let value = self.lower_expr(operand, None, out, line)?;
            operands.push(self.scalar_operand(value, line, "comparison")?);
        }

        let mut result: Option<ir::Expr> = None;
        for (op, pair) in ops.iter().zip(operands.windows(2)) {
            let (lhs, ld) = &pair[0];
            let (rhs, rd) = &pair[1];
            let dtype = if ld.is_bool() && rd.is_bool() {
                DType::Bool
            } else {
                DType::promote(*ld, *rd)
            };
            let cmp = ir::Expr::compare(CompareOp::from_ast(*op), lhs.clone().cast(dtype), rhs.clone().cast(dtype));
            result = Some(match result {
                None => cmp,
                Some(acc) => ir::Expr::logical(LogicalOp::And, acc, cmp),
            });
        }
        result
            .map(|expr| Value::scalar(expr, DType::Bool))
            .ok_or_else(|| CompileError::parse_error(line, "comparison without operator"))
    }

    fn lower_boolop(&mut self, op: BoolOp, values: &[Expr], out: &mut Vec<Stmt>, line: usize) -> CompileResult<Value> {
        let op = match op {
            BoolOp::And => LogicalOp::And,
            BoolOp::Or => LogicalOp::Or,
        };
        let mut result: Option<ir::Expr> = None;
        for value in values {
            let value = self.lower_expr(value, None, out, line)?;
            let (expr, _) = self.scalar_operand(value, line, "boolean operation")?;
            let expr = expr.cast(DType::Bool);
            result = Some(match result {
                None => expr,
                Some(acc) => ir::Expr::logical(op, acc, expr),
            });
        }
        result
            .map(|expr| Value::scalar(expr, DType::Bool))
            .ok_or_else(|| CompileError::parse_error(line, "boolean operation without operands"))
    }

    fn lower_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[Keyword],
        out: &mut Vec<Stmt>,
        line: usize,
    ) -> CompileResult<Value> {
        let Expr::Name(name) = func else {
            return Err(CompileError::unsupported(
                line,
                format!("calls through {} are not supported", func.kind_name()),
            ));
        };
        if name == "range" {
            return Err(CompileError::unsupported(line, "range() is only valid as a for-loop iterator"));
        }
        let Some(dtype) = DType::from_name(name) else {
            return Err(CompileError::unsupported(line, format!("call to '{}' is not supported", name)));
        };

        let [arg] = args else {
            return Err(CompileError::type_error(line, format!("{}() takes exactly one argument", name)));
        };
        if !keywords.is_empty() {
            return Err(CompileError::type_error(line, format!("{}() takes no keyword arguments", name)));
        }

        match self.lower_expr(arg, None, out, line)? {
            Value::Scalar { expr, .. } => Ok(Value::scalar(expr.cast(dtype), dtype)),
            Value::Array(src) => {
                let mut emitter = self.emitter(out);
                let converted = emitter.temp_buffer(src.ty.with_dtype(dtype));
                emitter.materialize(&converted, &Value::Array(src), line)?;
                Ok(Value::Array(converted))
            }
            Value::None => Err(CompileError::type_error(line, format!("cannot convert None to {}", dtype))),
        }
    }

    fn scalar_operand(&self, value: Value, line: usize, what: &str) -> CompileResult<(ir::Expr, DType)> {
        match value {
            Value::Scalar { expr, dtype } => Ok((expr, dtype)),
            Value::Array(buffer) => Err(CompileError::unsupported(
                line,
                format!("{} of array '{}' is not supported", what, buffer.name),
            )),
            Value::None => Err(CompileError::type_error(line, format!("{} of None", what))),
        }
    }

    /// Integer scalar widened to int64
    fn integer_operand(&self, value: Value, line: usize, what: &str) -> CompileResult<ir::Expr> {
        let ty = value.ty();
        match value {
            Value::Scalar { expr, dtype } if dtype.is_int() => Ok(expr.cast(DType::Int64)),
            _ => Err(CompileError::type_error(
                line,
                format!("{} must be an integer, got {}", what, ty),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kernel::KernelParser;
    use pretty_assertions::assert_eq;

    fn lower(source: &str) -> CompileResult<ir::Function> {
        KernelParser::new(source, ParserConfig::new(true))?
            .parse()
            .map(|kernel| kernel.function)
    }

    fn body_text(source: &str) -> String {
        match lower(source) {
            Ok(function) => function.body.to_string(),
            Err(e) => panic!("lowering failed: {}", e),
        }
    }

    #[test]
    fn test_scalar_declaration_and_assignment() {
        let text = body_text(
            "def k(a: int32[N]) -> None:\n    x: float32 = 1\n    x = a[0] + 2\n",
        );
        assert_eq!(
            text,
            "x: float32 = float32(1.0)\nx = float32((int64(a[0]) + 2))\nreturn None\n"
        );
    }

    #[test]
    fn test_array_assignment_materializes_into_target() {
        let text = body_text(
            "def k(a: int32[N], b: int32[N]) -> None:\n    c: float32[N]\n    c = a + b\n",
        );
        assert_eq!(
            text,
            "c = allocate(float32[N])\n\
             for __ax0 in range(0, N, 1):\n    c[__ax0] = float32((a[__ax0] + b[__ax0]))\n\
             return None\n"
        );
    }

    #[test]
    fn test_return_expression_uses_return_buffer() {
        let function = lower("def k(a: int32[N], b: int32[N]) -> int32[N]:\n    return a + b\n").unwrap();
        let text = function.body.to_string();
        assert!(text.starts_with("__return = allocate(int32[N])\n"));
        assert!(text.ends_with("return __return\n"));
        assert!(!text.contains("__tmp"));
    }

    #[test]
    fn test_bare_return_of_array_kernel() {
        let text = body_text("def k(a: int32[N]) -> float32[N]:\n    a[0] = 1\n");
        assert_eq!(
            text,
            "__return = allocate(float32[N])\na[0] = int32(1)\nreturn __return\n"
        );
    }

    #[test]
    fn test_return_converts_dtype() {
        let text = body_text("def k(a: int32[N]) -> float64[N]:\n    return a\n");
        assert_eq!(
            text,
            "__return = allocate(float64[N])\n\
             for __ax0 in range(0, N, 1):\n    __return[__ax0] = float64(a[__ax0])\n\
             return __return\n"
        );
    }

    #[test]
    fn test_scalar_return_requires_value() {
        let err = lower("def k(a: int32[N]) -> int32:\n    a[0] = 1\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(
            body_text("def k(a: int32[N]) -> int64:\n    return a[0]\n"),
            "return int64(a[0])\n"
        );
    }

    #[test]
    fn test_augmented_assignment() {
        let text = body_text("def k(a: int32[N]) -> None:\n    for i in range(N):\n        a[i] += 1\n");
        assert_eq!(
            text,
            "for i in range(0, N, 1):\n    a[i] = int32((int64(a[i]) + 1))\nreturn None\n"
        );
    }

    #[test]
    fn test_index_bounds_use_loop_assumptions() {
        assert!(lower("def k(a: int32[N]) -> None:\n    for i in range(N - 1):\n        a[i + 1] = 0\n").is_ok());

        let err = lower("def k(a: int32[N]) -> None:\n    for i in range(N):\n        a[i + N] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexOutOfBounds);

        let err = lower("def k(a: int32[N]) -> None:\n    a[-1] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexOutOfBounds);
    }

    #[test]
    fn test_float_index_is_rejected() {
        let err = lower("def k(a: int32[N]) -> None:\n    a[N / 2] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_loop_bindings_do_not_leak() {
        let err = lower(
            "def k(a: int32[N]) -> None:\n    for i in range(N):\n        t: int32 = a[i]\n    t = 1\n",
        )
        .unwrap_err();
        assert_eq!(err, CompileError::undeclared_target(4, "t"));
    }

    #[test]
    fn test_enclosing_variable_assigned_in_loop() {
        let text = body_text(
            "def k(a: int32[N]) -> int32:\n    s: int32 = 0\n    for i in range(N):\n        s = s + a[i]\n    return s\n",
        );
        assert_eq!(
            text,
            "s: int32 = int32(0)\nfor i in range(0, N, 1):\n    s = (s + a[i])\nreturn s\n"
        );
    }

    #[test]
    fn test_redeclaration() {
        assert!(lower("def k(a: int32[N]) -> None:\n    x: int32 = 1\n    x: int32 = 2\n").is_ok());
        let err = lower("def k(a: int32[N]) -> None:\n    x: int32 = 1\n    x: float32 = 2\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        // shadowing in an inner block is allowed
        assert!(lower(
            "def k(a: int32[N]) -> None:\n    x: int32 = 1\n    for i in range(N):\n        x: float32 = 2.0\n"
        )
        .is_ok());
    }

    #[test]
    fn test_compare_chain_and_boolop() {
        let text = body_text(
            "def k(a: int32[N]) -> None:\n    if 0 < a[0] <= 3 and a[1] != 0:\n        a[0] = 0\n",
        );
        assert!(text.starts_with("if (((0 < int64(a[0])) and (int64(a[0]) <= 3)) and (int64(a[1]) != 0)):\n"));
    }

    #[test]
    fn test_cast_calls() {
        let text = body_text("def k(a: int32[N]) -> None:\n    x: float64 = float32(a[0])\n");
        assert_eq!(text, "x: float64 = float64(float32(a[0]))\nreturn None\n");

        let err = lower("def k(a: int32[N]) -> None:\n    x: int32 = len(a)\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConstruct);
    }

    #[test]
    fn test_reassignment_flags() {
        let kernel = KernelParser::new(
            "def k(a: int32[N], b: int32[N]) -> None:\n    a[0] = b[0]\n",
            ParserConfig::new(true),
        )
        .unwrap()
        .parse()
        .unwrap();
        assert!(kernel.context.is_reassigned("a"));
        assert!(!kernel.context.is_reassigned("b"));
    }

    #[test]
    fn test_shape_symbols_are_read_only() {
        let err = lower("def k(a: int32[N]) -> None:\n    N = 3\n").unwrap_err();
        assert_eq!(err, CompileError::undeclared_target(2, "N"));
        let err = lower("def k(a: int32[N]) -> None:\n    N: int32 = 3\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_docstring_is_skipped() {
        let text = body_text("def k(a: int32[N]) -> None:\n    \"\"\"Zero the first element.\"\"\"\n    a[0] = 0\n");
        assert_eq!(text, "a[0] = int32(0)\nreturn None\n");
    }

    #[test]
    fn test_overflowing_index_is_left_unchecked() {
        let text = body_text("def k(a: int32[N]) -> None:\n    a[9223372036854775807 + 1] = 0\n");
        assert_eq!(text, "a[(9223372036854775807 + 1)] = int32(0)\nreturn None\n");

        assert!(lower("def k(a: int32[N]) -> None:\n    a[N * 9223372036854775807 * 2] = 0\n").is_ok());

        let text = body_text(
            "def k(a: int32[N]) -> None:\n    for i in range(9223372036854775807 + 1):\n        a[i] = 0\n",
        );
        assert_eq!(
            text,
            "for i in range(0, (9223372036854775807 + 1), 1):\n    a[i] = int32(0)\nreturn None\n"
        );
    }

    #[test]
    fn test_shadowing_buffer_gets_its_own_name() {
        let text = body_text(
            "def k(a: int32[N]) -> None:\n    c: int32[N] = a\n    for i in range(N):\n        c: float32[N] = c\n        a[i] = int32(c[i])\n",
        );
        assert_eq!(
            text,
            "c = allocate(int32[N])\n\
             for __ax0 in range(0, N, 1):\n    c[__ax0] = a[__ax0]\n\
             for i in range(0, N, 1):\n    \
             c.1 = allocate(float32[N])\n    \
             for __ax0 in range(0, N, 1):\n        c.1[__ax0] = float32(c[__ax0])\n    \
             a[i] = int32(c.1[i])\n\
             return None\n"
        );
    }

    #[test]
    fn test_nested_loop_reusing_a_name_is_renamed() {
        let text = body_text(
            "def k(a: int32[N]) -> None:\n    for i in range(N):\n        for i in range(N):\n            a[i] = 0\n",
        );
        assert_eq!(
            text,
            "for i in range(0, N, 1):\n    for i.1 in range(0, N, 1):\n        a[i.1] = int32(0)\nreturn None\n"
        );
    }

    #[test]
    fn test_reserved_names_are_rejected() {
        let err = lower("def k(a: int32[N]) -> None:\n    __return: int32[N] = a\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);

        let err = lower("def k(a: int32[N]) -> None:\n    for __ax0 in range(N):\n        a[__ax0] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);

        let err = lower("def k(__tmp0: int32[N]) -> None:\n    __tmp0[0] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);

        let err = lower("def k(a: int32[N]) -> None:\n    __session_handle: int32 = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_shape_symbol_cannot_be_loop_variable() {
        let err = lower("def k(a: int32[N]) -> None:\n    for N in range(3):\n        a[0] = N\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        assert!(err.to_string().contains("'N' is a shape symbol"));
    }

    #[test]
    fn test_range_with_start_and_stop() {
        let text = body_text("def k(a: int32[N]) -> None:\n    for i in range(1, N):\n        a[i] = 0\n");
        assert_eq!(text, "for i in range(1, N, 1):\n    a[i] = int32(0)\nreturn None\n");
    }

    #[test]
    fn test_range_with_symbolic_bounds_and_step() {
        let text = body_text("def k(a: int32[M]) -> None:\n    for i in range(2, M // 2, 2):\n        a[i] = 0\n");
        assert_eq!(text, "for i in range(2, (M // 2), 2):\n    a[i] = int32(0)\nreturn None\n");

        let text = body_text(
            "def k(a: int32[N]) -> None:\n    for i in range(N - 10, N - 1, 1):\n        a[i] = 0\n",
        );
        assert_eq!(text, "for i in range((N - 10), (N - 1), 1):\n    a[i] = int32(0)\nreturn None\n");
    }

    #[test]
    fn test_range_with_negative_step() {
        let text = body_text("def k(a: int32[N]) -> None:\n    for i in range(N - 1, -1, -1):\n        a[i] = 0\n");
        assert_eq!(text, "for i in range((N - 1), -1, -1):\n    a[i] = int32(0)\nreturn None\n");

        let err = lower("def k(a: int32[N]) -> None:\n    for i in range(N, 0, 0):\n        a[0] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_loop_variable_is_nonnegative_only_from_a_nonnegative_start() {
        // from range(N) the index is provably negative
        let err = lower("def k(a: int32[N]) -> None:\n    for i in range(N):\n        a[-1 - i] = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexOutOfBounds);

        // N - 10 may be negative, so nothing is proven about i
        let text = body_text(
            "def k(a: int32[N]) -> None:\n    for i in range(N - 10, N):\n        a[-1 - i] = 0\n",
        );
        assert_eq!(
            text,
            "for i in range((N - 10), N, 1):\n    a[((-1 * i) - 1)] = int32(0)\nreturn None\n"
        );

        // a negative step gives no assumption either
        assert!(lower("def k(a: int32[N]) -> None:\n    for i in range(N - 1, -1, -1):\n        a[-1 - i] = 0\n").is_ok());
    }

    #[test]
    fn test_index_with_floor_div_by_loop_expression() {
        let text = body_text(
            "def k(a: int32[M, N]) -> None:\n    for i in range(M):\n        for j in range(N):\n            a[M // (i + j + 1), j] = 0\n",
        );
        assert_eq!(
            text,
            "for i in range(0, M, 1):\n    for j in range(0, N, 1):\n        a[(M // ((i + j) + 1)), j] = int32(0)\nreturn None\n"
        );
    }
}
