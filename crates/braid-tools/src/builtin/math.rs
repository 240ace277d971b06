use futures::future::BoxFuture;
use serde::Deserialize;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Tool;
use braid_core::types::{ToolContext, ToolResult};

use crate::registry::ToolRegistry;

pub fn register_all(registry: &mut ToolRegistry) {
    for tool in BINARY_OPS {
        registry.register(tool.clone());
    }
    registry.register(UnaryTool {
        name: "sqrt",
        description: "Calculate the square root of x. x must be non-negative.",
        op: |x| {
            if x < 0.0 {
                return Err("Square root of a negative number is not allowed.".into());
            }
            Ok(x.sqrt())
        },
    });
    registry.register(UnaryTool {
        name: "abs_val",
        description: "Return the absolute value of x.",
        op: |x| Ok(x.abs()),
    });
    registry.register(AverageTool);
}

/// Render a result the way a person would write it: whole numbers without a fraction.
pub(crate) fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn invalid(tool: &str, message: String) -> BraidError {
    BraidError::ToolExecution {
        tool: tool.to_string(),
        message,
    }
}

// ── Binary operations ───────────────────────────────────────────

type BinaryOp = fn(f64, f64) -> std::result::Result<f64, String>;

#[derive(Clone)]
pub struct BinaryTool {
    name: &'static str,
    description: &'static str,
    op: BinaryOp,
}

#[derive(Deserialize)]
struct BinaryInput {
    a: f64,
    b: f64,
}

const BINARY_OPS: &[BinaryTool] = &[
    BinaryTool {
        name: "add",
        description: "Add two numbers.",
        op: |a, b| Ok(a + b),
    },
    BinaryTool {
        name: "subtract",
        description: "Subtract b from a.",
        op: |a, b| Ok(a - b),
    },
    BinaryTool {
        name: "multiply",
        description: "Multiply a and b.",
        op: |a, b| Ok(a * b),
    },
    BinaryTool {
        name: "divide",
        description: "Divide a by b. b must not be zero.",
        op: |a, b| {
            if b == 0.0 {
                return Err("Division by zero is not allowed.".into());
            }
            Ok(a / b)
        },
    },
    BinaryTool {
        name: "power",
        description: "Raise a to the power of b.",
        op: |a, b| {
            let r = a.powf(b);
            if r.is_nan() {
                return Err(format!("{} to the power of {} is not a real number.", a, b));
            }
            Ok(r)
        },
    },
    BinaryTool {
        name: "max_val",
        description: "Return the larger of two numbers.",
        op: |a, b| Ok(a.max(b)),
    },
    BinaryTool {
        name: "min_val",
        description: "Return the smaller of two numbers.",
        op: |a, b| Ok(a.min(b)),
    },
];

impl Tool for BinaryTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        self.description
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "description": "The first number" },
                "b": { "type": "number", "description": "The second number" }
            },
            "required": ["a", "b"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: BinaryInput = serde_json::from_value(input)
                .map_err(|e| BraidError::ToolValidation(e.to_string()))?;
            let value = (self.op)(p.a, p.b).map_err(|m| invalid(self.name, m))?;
            Ok(ToolResult::success(format_number(value)))
        })
    }
}

// ── Unary operations ────────────────────────────────────────────

pub struct UnaryTool {
    name: &'static str,
    description: &'static str,
    op: fn(f64) -> std::result::Result<f64, String>,
}

#[derive(Deserialize)]
struct UnaryInput {
    x: f64,
}

impl Tool for UnaryTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        self.description
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "number" } },
            "required": ["x"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: UnaryInput = serde_json::from_value(input)
                .map_err(|e| BraidError::ToolValidation(e.to_string()))?;
            let value = (self.op)(p.x).map_err(|m| invalid(self.name, m))?;
            Ok(ToolResult::success(format_number(value)))
        })
    }
}

// ── AverageTool ─────────────────────────────────────────────────

pub struct AverageTool;

#[derive(Deserialize)]
struct AverageInput {
    values: Vec<f64>,
}

impl Tool for AverageTool {
    fn name(&self) -> &str {
        "average"
    }
    fn description(&self) -> &str {
        "Calculate the average of a non-empty list of numbers."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "values": { "type": "array", "items": { "type": "number" } }
            },
            "required": ["values"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: AverageInput = serde_json::from_value(input)
                .map_err(|e| BraidError::ToolValidation(e.to_string()))?;
            if p.values.is_empty() {
                return Err(invalid("average", "Values list cannot be empty.".into()));
            }
            let mean = p.values.iter().sum::<f64>() / p.values.len() as f64;
            Ok(ToolResult::success(format_number(mean)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::types::SessionId;

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from_string("s"),
            call_id: "c".into(),
        }
    }

    async fn run(name: &str, input: serde_json::Value) -> Result<ToolResult> {
        ToolRegistry::with_builtins().execute(name, input, ctx()).await
    }

    #[tokio::test]
    async fn test_arithmetic() {
        let r = run("add", serde_json::json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(r.content, "5");
        let r = run("subtract", serde_json::json!({"a": 2, "b": 3.5})).await.unwrap();
        assert_eq!(r.content, "-1.5");
        let r = run("multiply", serde_json::json!({"a": 4, "b": 2.5})).await.unwrap();
        assert_eq!(r.content, "10");
        let r = run("divide", serde_json::json!({"a": 1, "b": 4})).await.unwrap();
        assert_eq!(r.content, "0.25");
        let r = run("power", serde_json::json!({"a": 2, "b": 10})).await.unwrap();
        assert_eq!(r.content, "1024");
        let r = run("max_val", serde_json::json!({"a": -1, "b": 7})).await.unwrap();
        assert_eq!(r.content, "7");
        let r = run("min_val", serde_json::json!({"a": -1, "b": 7})).await.unwrap();
        assert_eq!(r.content, "-1");
        let r = run("abs_val", serde_json::json!({"x": -3})).await.unwrap();
        assert_eq!(r.content, "3");
        let r = run("sqrt", serde_json::json!({"x": 16})).await.unwrap();
        assert_eq!(r.content, "4");
        let r = run("average", serde_json::json!({"values": [1, 2, 3, 4]})).await.unwrap();
        assert_eq!(r.content, "2.5");
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_recoverable() {
        for (name, input) in [
            ("divide", serde_json::json!({"a": 1, "b": 0})),
            ("sqrt", serde_json::json!({"x": -4})),
            ("average", serde_json::json!({"values": []})),
            ("add", serde_json::json!({"a": "one", "b": 2})),
        ] {
            let err = run(name, input).await.unwrap_err();
            assert!(err.is_recoverable_tool_error(), "{} gave {:?}", name, err);
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }
}
