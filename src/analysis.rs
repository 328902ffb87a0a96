//! Source, module and dependency analysis
//!
//! Dependency discovery is a work-queue fixed point: every pass scans the
//! functions found by the previous pass for calls to other functions of the
//! module, and the analysis stops once a pass contributes nothing new.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::ast::{Expr, FunctionDef, Module, Stmt, StmtKind};
use crate::error::{CompileError, CompileResult};

/// Where each function sits in the source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub file_name: String,
    pub line_count: usize,
    /// name → (first line, last line)
    pub functions: BTreeMap<String, (usize, usize)>,
}

pub fn analyze_source(file_name: &str, source: &str, module: &Module) -> SourceInfo {
    SourceInfo {
        file_name: file_name.to_string(),
        line_count: source.lines().count(),
        functions: module
            .functions
            .iter()
            .map(|f| (f.name.clone(), (f.line, f.end_line)))
            .collect(),
    }
}

/// Names defined at module level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub functions: BTreeSet<String>,
}

pub fn analyze_module(module: &Module) -> ModuleInfo {
    ModuleInfo {
        functions: module.functions.iter().map(|f| f.name.clone()).collect(),
    }
}

/// Names of module functions called anywhere in `def`, in first-call order
pub fn called_functions(def: &FunctionDef, module: &ModuleInfo) -> Vec<String> {
    let mut found = Vec::new();
    visit_block(&def.body, &mut |expr| {
        if let Expr::Call { func, .. } = expr {
            if let Expr::Name(name) = func.as_ref() {
                if module.functions.contains(name) && !found.contains(name) {
                    found.push(name.clone());
                }
            }
        }
    });
    found
}

fn visit_block<'a>(body: &'a [Stmt], f: &mut impl FnMut(&'a Expr)) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    target.walk(f);
                }
                value.walk(f);
            }
            StmtKind::AnnAssign { target, value, .. } => {
                target.walk(f);
                if let Some(value) = value {
                    value.walk(f);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                target.walk(f);
                value.walk(f);
            }
            StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
                test.walk(f);
                visit_block(body, f);
                visit_block(orelse, f);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                target.walk(f);
                iter.walk(f);
                visit_block(body, f);
                visit_block(orelse, f);
            }
            StmtKind::Return { value: Some(value) } => value.walk(f),
            StmtKind::Expr(expr) => expr.walk(f),
            StmtKind::FunctionDef(def) => visit_block(&def.body, f),
            StmtKind::Return { value: None } | StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
    }
}

/// Result of the dependency fixed point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub source: SourceInfo,
    pub module: ModuleInfo,
    /// Functions reachable from the kernel, in discovery order
    pub dependencies: Vec<String>,
    pub passes: usize,
}

/// Run source, module and dependency analysis until no new dependency appears
pub fn run_to_fixed_point(
    file_name: &str,
    source: &str,
    module: &Module,
    kernel: &str,
    max_passes: usize,
) -> CompileResult<Analysis> {
    let mut seen: BTreeSet<String> = BTreeSet::from([kernel.to_string()]);
    let mut dependencies = Vec::new();
    let mut frontier = vec![kernel.to_string()];
    let mut passes = 0;

    loop {
        let source_info = analyze_source(file_name, source, module);
        let module_info = analyze_module(module);

        if passes >= max_passes {
            return Err(CompileError::AnalysisDiverged { passes });
        }
        passes += 1;

        let mut discovered = Vec::new();
        for name in &frontier {
            let Some(def) = module.function(name) else {
                continue;
            };
            for callee in called_functions(def, &module_info) {
                if seen.insert(callee.clone()) {
                    debug!(caller = %name, callee = %callee, "new dependency");
                    discovered.push(callee);
                }
            }
        }

        if discovered.is_empty() {
            info!(kernel, passes, dependencies = dependencies.len(), "dependency analysis converged");
            return Ok(Analysis {
                source: source_info,
                module: module_info,
                dependencies,
                passes,
            });
        }
        dependencies.extend(discovered.iter().cloned());
        frontier = discovered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;
    use pretty_assertions::assert_eq;

    const CHAIN: &str = "\
def helper2(a: int32[N]) -> None:
    return

def helper1(a: int32[N]) -> None:
    helper2(a)

def kernel(a: int32[N]) -> None:
    if a[0] > 0:
        helper1(a)
    x: int32 = float32(a[0])
";

    #[test]
    fn test_dependencies_follow_call_chain() {
        let module = parse_module(CHAIN).unwrap();
        let analysis = run_to_fixed_point("chain.py", CHAIN, &module, "kernel", 8).unwrap();

        assert_eq!(analysis.dependencies, vec!["helper1".to_string(), "helper2".to_string()]);
        assert_eq!(analysis.passes, 3);
        assert_eq!(analysis.source.functions.get("kernel"), Some(&(7, 10)));
        assert_eq!(analysis.module.functions.len(), 3);
    }

    #[test]
    fn test_pass_bound_is_enforced() {
        let module = parse_module(CHAIN).unwrap();
        let err = run_to_fixed_point("chain.py", CHAIN, &module, "kernel", 2).unwrap_err();
        assert_eq!(err, CompileError::AnalysisDiverged { passes: 2 });
    }

    #[test]
    fn test_recursion_terminates() {
        let source = "def kernel(a: int32[N]) -> None:\n    kernel(a)\n";
        let module = parse_module(source).unwrap();
        let analysis = run_to_fixed_point("<kernel>", source, &module, "kernel", 4).unwrap();
        assert!(analysis.dependencies.is_empty());
        assert_eq!(analysis.passes, 1);
    }
}
