//! Kernel parser: the compile driver
//!
//! Turns kernel source into an IR function: parse, select the kernel, read
//! its signature, collect shape symbols, run the dependency analysis to a
//! fixed point and lower the body. The driver is also the error boundary.
//! In development mode errors surface with their structured kind; otherwise
//! they are collapsed into [`CompileError::Opaque`], which keeps only the
//! rendered message.

use tracing::{debug, info};

use crate::analysis;
use crate::ast::{FunctionDef, Module};
use crate::config::ParserConfig;
use crate::error::{CompileError, CompileResult};
use crate::ir;
use crate::parser::{dedent, Parser};
use crate::symbol::SymbolTable;
use crate::types::{ArrayType, KernelType};
use crate::visitor::{FunctionContext, LoweringEngine};

/// Backend that turns printed IR into a loadable module
pub trait ModuleBuilder {
    type Module;

    fn build(&mut self, function: &ir::Function, code: &str) -> CompileResult<Self::Module>;
}

/// Output of a successful compile
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledKernel {
    pub function: ir::Function,
    /// Module functions the kernel calls, directly or transitively
    pub dependencies: Vec<String>,
    pub context: FunctionContext,
}

/// Driver for one kernel function
#[derive(Debug, Clone)]
pub struct KernelParser {
    config: ParserConfig,
    source: String,
    module: Module,
    function: FunctionDef,
    context: FunctionContext,
    symbols: SymbolTable,
}

impl KernelParser {
    /// Prepare the first function defined in `source`
    pub fn new(source: &str, config: ParserConfig) -> CompileResult<Self> {
        let dev_mode = config.dev_mode;
        Self::prepare(source, None, config).map_err(|e| error_boundary(dev_mode, e))
    }

    /// Prepare the function called `name`
    pub fn for_function(source: &str, name: &str, config: ParserConfig) -> CompileResult<Self> {
        let dev_mode = config.dev_mode;
        Self::prepare(source, Some(name), config).map_err(|e| error_boundary(dev_mode, e))
    }

    fn prepare(source: &str, name: Option<&str>, config: ParserConfig) -> CompileResult<Self> {
        let source = dedent(source);
        let module = Parser::new(&source)?.parse_module()?;

        let function = match name {
            Some(name) => module
                .function(name)
                .cloned()
                .ok_or_else(|| CompileError::unresolved(1, name))?,
            None => module
                .functions
                .first()
                .cloned()
                .ok_or_else(|| CompileError::parse_error(1, "no function definition found"))?,
        };
        if !function.decorators.is_empty() {
            debug!(function = %function.name, count = function.decorators.len(), "ignoring decorators");
        }

        let (args, return_type) = extract_signature(&function)?;
        let symbols = SymbolTable::from_types(args.iter().map(|(_, ty)| ty));
        if let KernelType::Array(ret) = &return_type {
            for dim in &ret.shape {
                if let Some(unknown) = dim.free_symbols().into_iter().find(|s| !symbols.contains(s)) {
                    return Err(CompileError::unresolved(function.line, unknown));
                }
            }
        }
        info!(
            function = %function.name,
            params = args.len(),
            symbols = symbols.len(),
            "extracted kernel signature"
        );

        let context = FunctionContext::new(function.name.clone(), args, return_type);
        Ok(Self {
            config,
            source,
            module,
            function,
            context,
            symbols,
        })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Signature context before lowering; reassignment flags all unset
    pub fn context(&self) -> &FunctionContext {
        &self.context
    }

    pub fn function_def(&self) -> &FunctionDef {
        &self.function
    }

    /// Lower the kernel to IR
    pub fn parse(&self) -> CompileResult<CompiledKernel> {
        self.lower().map_err(|e| error_boundary(self.config.dev_mode, e))
    }

    fn lower(&self) -> CompileResult<CompiledKernel> {
        let analysis = analysis::run_to_fixed_point(
            &self.config.file_name,
            &self.source,
            &self.module,
            &self.function.name,
            self.config.max_analysis_passes,
        )?;

        let mut engine = LoweringEngine::new(&self.config, &self.symbols, self.context.clone());
        let function = engine.lower_function(&self.function)?;
        info!(function = %function.name, "lowered kernel");

        Ok(CompiledKernel {
            function,
            dependencies: analysis.dependencies,
            context: engine.into_context(),
        })
    }

    /// Lower the kernel and hand its printed IR to `builder`
    pub fn build_with<B: ModuleBuilder>(&self, builder: &mut B) -> CompileResult<B::Module> {
        let kernel = self.parse()?;
        let code = kernel.function.to_string();
        builder
            .build(&kernel.function, &code)
            .map_err(|e| error_boundary(self.config.dev_mode, e))
    }
}

fn error_boundary(dev_mode: bool, err: CompileError) -> CompileError {
    if dev_mode {
        err
    } else {
        err.into_opaque()
    }
}

/// Parameter array types and the declared return type
fn extract_signature(function: &FunctionDef) -> CompileResult<(Vec<(String, ArrayType)>, KernelType)> {
    let mut args: Vec<(String, ArrayType)> = Vec::with_capacity(function.params.len());
    for param in &function.params {
        if args.iter().any(|(name, _)| *name == param.name) {
            return Err(CompileError::parse_error(
                function.line,
                format!("duplicate parameter '{}'", param.name),
            ));
        }
        let ty = match &param.annotation {
            Some(annotation) => KernelType::from_annotation(annotation, function.line)?,
            None => KernelType::None,
        };
        let KernelType::Array(array) = ty else {
            return Err(CompileError::unsupported(
                function.line,
                format!("parameter '{}' must be annotated with an array type", param.name),
            ));
        };
        args.push((param.name.clone(), array));
    }

    let return_type = match &function.returns {
        Some(annotation) => KernelType::from_annotation(annotation, function.line)?,
        None => KernelType::None,
    };
    Ok((args, return_type))
}
