//! Kernel to IR Compiler CLI
//!
//! Usage:
//!   kernel2ir kernel.py
//!   kernel2ir kernel.py --function add --json
//!   cat kernel.py | kernel2ir --dev -v

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};
use tracing_subscriber::{fmt, EnvFilter};

use kernel_to_ir::{CompiledKernel, ErrorKind, KernelParser, ParserConfig};

#[derive(ClapParser, Debug)]
#[command(name = "kernel2ir")]
#[command(author = "Kernel Team")]
#[command(version = "0.1.0")]
#[command(about = "Lowers shape-annotated kernel functions to a typed IR")]
struct Args {
    /// Kernel source file; reads stdin when omitted
    #[arg(value_name = "FILE")]
    input_file: Option<String>,

    /// Function to compile (defaults to the first one in the file)
    #[arg(short = 'f', long = "function")]
    function: Option<String>,

    /// Load parser configuration from a JSON file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Development mode: report structured errors
    #[arg(long = "dev")]
    dev: bool,

    /// Output the IR function as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "kernel_to_ir=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let (source, file_name) = if let Some(file) = &args.input_file {
        let source = fs::read_to_string(file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        });
        (source, file.clone())
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        (buffer, "<stdin>".to_string())
    };

    let mut config = match &args.config {
        Some(path) => ParserConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }),
        None => ParserConfig::from_env(),
    };
    config.dev_mode |= args.dev;
    let config = config.with_file_name(file_name);

    let parser = match &args.function {
        Some(name) => KernelParser::for_function(&source, name, config),
        None => KernelParser::new(&source, config),
    };
    let result = parser.and_then(|parser| parser.parse());

    let kernel = match result {
        Ok(kernel) => kernel,
        Err(e) => {
            let label = match e.kind() {
                ErrorKind::Lexer | ErrorKind::Parse => "Parse error",
                ErrorKind::Type | ErrorKind::ShapeMismatch | ErrorKind::IndexOutOfBounds => "Type error",
                ErrorKind::UnsupportedConstruct => "Unsupported",
                _ => "Compilation error",
            };
            eprintln!("{}: {}", label.red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match kernel.function.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_kernel(&kernel, args.verbose);
    }
}

fn print_kernel(kernel: &CompiledKernel, verbose: bool) {
    let function = &kernel.function;

    if verbose {
        println!("{}", "Kernel to IR Compiler".bold().blue());
        println!("{}", "=".repeat(40));
        println!();
        println!(
            "{}: {} (lines {}-{})",
            "Source".green(),
            function.span.file,
            function.span.line,
            function.span.end_line
        );
        println!("{}: {}", "Parameters".green(), function.params.len());
        for binding in &function.symbols {
            println!(
                "  {} {} = {}.shape[{}]",
                "symbol".cyan(),
                binding.symbol,
                binding.param,
                binding.axis
            );
        }
        let reassigned: Vec<&str> = kernel
            .context
            .arg_names
            .iter()
            .filter(|name| kernel.context.is_reassigned(name))
            .map(String::as_str)
            .collect();
        if !reassigned.is_empty() {
            println!("{}: {}", "Reassigned".green(), reassigned.join(", "));
        }
        if !kernel.dependencies.is_empty() {
            println!("{}: {}", "Dependencies".green(), kernel.dependencies.join(", "));
        }
        println!();
    }

    print!("{}", function);
}
