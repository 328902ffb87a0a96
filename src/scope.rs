//! Lexical scope stack used while lowering
//!
//! Each [`Frame`] owns the statements of one block that have not been visited
//! yet and the names bound inside that block. Lookups read through to the
//! enclosing frames; new bindings only ever go into the innermost frame.

use std::collections::BTreeMap;

use tracing::debug;

use crate::ast::Stmt;
use crate::error::CompileResult;
use crate::ir::{Buffer, PrimVar};
use crate::symbol::Assumptions;
use crate::types::{DType, KernelType};

/// What a name is bound to
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Scalar {
        var: PrimVar,
        dtype: DType,
        /// Provably non-negative (loop induction variables)
        nonneg: bool,
    },
    Array(Buffer),
}

impl Binding {
    pub fn scalar(var: PrimVar, dtype: DType) -> Self {
        Binding::Scalar {
            var,
            dtype,
            nonneg: false,
        }
    }

    pub fn ty(&self) -> KernelType {
        match self {
            Binding::Scalar { dtype, .. } => KernelType::Scalar(*dtype),
            Binding::Array(buffer) => KernelType::Array(buffer.ty.clone()),
        }
    }
}

/// Block kind a frame was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Function,
    Loop,
    Branch,
}

/// One lexical level
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    /// Unvisited statements, last statement first
    worklist: Vec<Stmt>,
    bindings: BTreeMap<String, Binding>,
}

impl Frame {
    pub fn new(kind: FrameKind, body: &[Stmt]) -> Self {
        Self {
            kind,
            worklist: body.iter().rev().cloned().collect(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    pub fn remaining(&self) -> usize {
        self.worklist.len()
    }
}

/// Stack of frames for one function lowering
#[derive(Debug, Clone, Default)]
pub struct ScopeContext {
    frames: Vec<Frame>,
    base: Assumptions,
}

impl ScopeContext {
    /// An empty stack; `base` holds the shape-symbol assumptions
    pub fn new(base: Assumptions) -> Self {
        Self {
            frames: Vec::new(),
            base,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: Frame) {
        debug!(kind = ?frame.kind, depth = self.frames.len() + 1, "enter scope");
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop();
        if let Some(frame) = &frame {
            debug!(kind = ?frame.kind, depth = self.frames.len(), "leave scope");
        }
        frame
    }

    /// Next unvisited statement of the innermost frame
    pub fn next_stmt(&mut self) -> Option<Stmt> {
        self.frames.last_mut().and_then(|frame| frame.worklist.pop())
    }

    /// Statements still queued in the innermost frame
    pub fn remaining(&self) -> usize {
        self.frames.last().map(Frame::remaining).unwrap_or(0)
    }

    /// Innermost binding of `name` across all frames
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames.iter().rev().find_map(|frame| frame.bindings.get(name))
    }

    /// Index of the innermost frame binding `name`; 0 is the function frame
    pub fn binding_depth(&self, name: &str) -> Option<usize> {
        self.frames.iter().rposition(|frame| frame.bindings.contains_key(name))
    }

    /// Binding of `name` in the innermost frame only
    pub fn lookup_local(&self, name: &str) -> Option<&Binding> {
        self.frames.last().and_then(|frame| frame.bindings.get(name))
    }

    /// Bind `name` in the innermost frame; no-op with no open frame
    pub fn bind(&mut self, name: impl Into<String>, binding: Binding) {
        if let Some(frame) = self.frames.last_mut() {
            frame.bindings.insert(name.into(), binding);
        }
    }

    /// Shape-symbol assumptions plus every visible non-negative scalar, by IR name
    pub fn assumptions(&self) -> Assumptions {
        let mut visible: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for frame in &self.frames {
            for (name, binding) in &frame.bindings {
                let nonneg = match binding {
                    Binding::Scalar { var, nonneg: true, .. } => Some(var.name.as_str()),
                    _ => None,
                };
                visible.insert(name.as_str(), nonneg);
            }
        }
        visible
            .into_values()
            .flatten()
            .fold(self.base.clone(), |asm, var| asm.with_nonneg_var(var))
    }
}

/// Owner of a scope stack; gives frames a scoped lifetime
pub trait Scoped: Sized {
    fn scope_mut(&mut self) -> &mut ScopeContext;

    /// Run `f` with `frame` pushed; the frame is popped whatever `f` returns
    fn with_scope<T>(
        &mut self,
        frame: Frame,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        self.scope_mut().push(frame);
        let result = f(self);
        self.scope_mut().pop();
        result
    }
}

impl Scoped for ScopeContext {
    fn scope_mut(&mut self) -> &mut ScopeContext {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;
    use crate::error::CompileError;
    use crate::symbol::SymExpr;
    use pretty_assertions::assert_eq;

    fn scalar(name: &str) -> Binding {
        Binding::scalar(PrimVar::scalar(name, DType::Int32), DType::Int32)
    }

    #[test]
    fn test_worklist_is_source_order() {
        let body = vec![
            Stmt::new(StmtKind::Pass, 1),
            Stmt::new(StmtKind::Break, 2),
            Stmt::new(StmtKind::Continue, 3),
        ];
        let mut scope = ScopeContext::default();
        scope.push(Frame::new(FrameKind::Function, &body));

        let lines: Vec<usize> = std::iter::from_fn(|| scope.next_stmt()).map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_lookup_reads_through_and_shadows() {
        let mut scope = ScopeContext::default();
        scope.push(Frame::new(FrameKind::Function, &[]).with_binding("x", scalar("x")));
        scope.push(Frame::new(FrameKind::Loop, &[]));

        assert!(scope.lookup("x").is_some());
        assert!(scope.lookup_local("x").is_none());

        scope.bind("x", Binding::scalar(PrimVar::scalar("x", DType::Float32), DType::Float32));
        assert_eq!(scope.lookup("x").map(Binding::ty), Some(KernelType::Scalar(DType::Float32)));

        scope.pop();
        assert_eq!(scope.lookup("x").map(Binding::ty), Some(KernelType::Scalar(DType::Int32)));
    }

    #[test]
    fn test_with_scope_pops_on_error() {
        let mut scope = ScopeContext::default();
        scope.push(Frame::new(FrameKind::Function, &[]));

        let result: CompileResult<()> = scope.with_scope(Frame::new(FrameKind::Branch, &[]), |inner| {
            inner.bind("y", scalar("y"));
            Err(CompileError::unresolved(1, "z"))
        });

        assert!(result.is_err());
        assert_eq!(scope.depth(), 1);
        assert!(scope.lookup("y").is_none());
    }

    #[test]
    fn test_assumptions_track_visible_loop_vars() {
        let mut asm = Assumptions::default();
        asm.positive_symbols.insert("N".into());
        let mut scope = ScopeContext::new(asm);

        let i = Binding::Scalar {
            var: PrimVar::scalar("i", DType::Int64),
            dtype: DType::Int64,
            nonneg: true,
        };
        scope.push(Frame::new(FrameKind::Loop, &[]).with_binding("i", i));
        let i_expr = SymExpr::var("i", DType::Int64);
        assert!(i_expr.is_nonneg(&scope.assumptions()));

        // a plain scalar of the same name hides the loop variable
        scope.push(Frame::new(FrameKind::Branch, &[]).with_binding("i", scalar("i")));
        assert!(!i_expr.is_nonneg(&scope.assumptions()));
        scope.pop();

        // a renamed inner loop variable is tracked under its IR name
        let inner = Binding::Scalar {
            var: PrimVar::scalar("i.1", DType::Int64),
            dtype: DType::Int64,
            nonneg: true,
        };
        scope.push(Frame::new(FrameKind::Loop, &[]).with_binding("i", inner));
        let asm = scope.assumptions();
        assert!(SymExpr::var("i.1", DType::Int64).is_nonneg(&asm));
        assert!(!i_expr.is_nonneg(&asm));
    }
}
