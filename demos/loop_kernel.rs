//! Example: Loop Kernel
//!
//! Lowers a kernel with nested loops over symbolic dimensions and shows the
//! shape-symbol bindings the IR function reads its extents from.
//!
//! Run with: cargo run --example loop_kernel

use kernel_to_ir::{KernelParser, ParserConfig};

const SOURCE: &str = r#"
def row_sum(a: float32[M, N], out: float32[M]) -> float32[M]:
    """Sum every row of a into out."""
    for i in range(M):
        acc: float32 = 0.0
        for j in range(N):
            acc += a[i, j]
        out[i] = acc
    return out
"#;

fn main() {
    println!("=== Loop Kernel Example ===\n");

    let config = ParserConfig::new(true).with_file_name("row_sum.py");
    let parser = KernelParser::new(SOURCE, config).unwrap();

    println!("Shape symbols:");
    for name in parser.symbols().names() {
        println!("  {}", name);
    }
    println!();

    let kernel = parser.parse().unwrap();
    println!("{}", kernel.function);

    for name in &kernel.context.arg_names {
        println!(
            "{} reassigned: {}",
            name,
            kernel.context.is_reassigned(name)
        );
    }
}
