//! Example: Elementwise Operations
//!
//! Array operands lower to loop nests over the broadcast shape. Returning an
//! expression writes it into the synthetic return buffer.
//!
//! Run with: cargo run --example elementwise

use kernel_to_ir::{compile_kernel, ErrorKind, ParserConfig};

fn main() {
    println!("=== Elementwise Operations Example ===\n");

    // Example 1: broadcast add with a dtype conversion on return
    println!("Example 1: return a + b, b broadcast along rows\n");
    let source = r#"
def add(a: int32[M, N], b: int32[1, N]) -> float32[M, N]:
    return a + b
"#;
    let kernel = compile_kernel(source, ParserConfig::new(true)).unwrap();
    println!("{}", kernel.function);

    // Example 2: the same IR as JSON
    println!("Example 2: JSON export\n");
    let source = r#"
def scale(a: float64[N]) -> None:
    a = a * 0.5
"#;
    let kernel = compile_kernel(source, ParserConfig::new(true)).unwrap();
    println!("{}", kernel.function.to_json().unwrap());
    println!();

    // Example 3: incompatible shapes are rejected
    println!("Example 3: shape mismatch\n");
    let source = r#"
def bad(a: int32[M, N], b: int32[N, M]) -> int32[M, N]:
    return a + b
"#;
    match compile_kernel(source, ParserConfig::new(true)) {
        Ok(_) => println!("unexpectedly compiled"),
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::ShapeMismatch);
            println!("rejected: {}", e);
        }
    }
}
