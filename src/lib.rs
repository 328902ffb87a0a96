//! Kernel to IR Compiler
//!
//! This library lowers kernel functions written in a small, statically typed
//! subset of Python into a typed, loop-level IR. Kernel parameters are arrays
//! annotated with a dtype and a shape whose dimensions may be symbolic
//! (`float32[M, N]`); the symbols become parameters of the generated
//! function, read from the shapes of the arrays that introduce them.
//!
//! # Example
//!
//! ```rust
//! use kernel_to_ir::{compile_kernel, ParserConfig};
//!
//! let source = r#"
//! def scale(a: float32[N]) -> float32[N]:
//!     for i in range(N):
//!         a[i] = a[i] * 2.0
//!     return a
//! "#;
//! let kernel = compile_kernel(source, ParserConfig::new(true)).unwrap();
//! println!("{}", kernel.function);
//! ```

pub mod analysis;
pub mod ast;
pub mod config;
pub mod error;
pub mod ir;
pub mod kernel;
pub mod lexer;
pub mod ops;
pub mod parser;
pub mod resolver;
pub mod scope;
pub mod symbol;
pub mod types;
pub mod visitor;

pub use config::ParserConfig;
pub use error::{CompileError, CompileResult, ErrorKind};
pub use ir::Function;
pub use kernel::{CompiledKernel, KernelParser, ModuleBuilder};
pub use parser::Parser;
pub use symbol::{SymExpr, SymbolTable};
pub use types::{ArrayType, DType, KernelType};
pub use visitor::FunctionContext;

/// Compile the first function in `source`
pub fn compile_kernel(source: &str, config: ParserConfig) -> CompileResult<CompiledKernel> {
    KernelParser::new(source, config)?.parse()
}

/// Compile the function called `name` in `source`
pub fn compile_function(source: &str, name: &str, config: ParserConfig) -> CompileResult<CompiledKernel> {
    KernelParser::for_function(source, name, config)?.parse()
}
