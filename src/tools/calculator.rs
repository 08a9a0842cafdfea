//! Calculator tool.
//!
//! Basic arithmetic on two numbers. Every failure is returned as an
//! `{"error": ..}` payload so the model can read it and recover.

use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct CalculatorArgs {
    pub a: f64,
    pub b: f64,
    pub op: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn name(&self) -> &str {
        "calculator"
    }

    pub fn description(&self) -> &str {
        "Perform a basic arithmetic operation on two numbers. Supported operations: add, sub, mul, div."
    }

    pub fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number", "description": "First operand"},
                "b": {"type": "number", "description": "Second operand"},
                "op": {"type": "string", "enum": ["add", "sub", "mul", "div"]}
            },
            "required": ["a", "b", "op"]
        })
    }

    pub fn call(&self, args: CalculatorArgs) -> Value {
        calculate(args.a, args.b, &args.op)
    }
}

/// Apply `op` to `a` and `b`, returning `{a, b, op, result}` or `{error}`.
pub fn calculate(a: f64, b: f64, op: &str) -> Value {
    let result = match op {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" => {
            if b == 0.0 {
                return json!({ "error": "Division by zero is not allowed" });
            }
            a / b
        }
        _ => return json!({ "error": format!("Unsupported operation '{op}'") }),
    };

    if !result.is_finite() {
        return json!({ "error": "Result is not a finite number" });
    }

    json!({ "a": a, "b": b, "op": op, "result": result })
}
