use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Tool;
use braid_core::types::{ToolContext, ToolResult};

use super::math::format_number;
use crate::registry::ToolRegistry;

pub fn register_all(registry: &mut ToolRegistry) {
    registry.register(NowTool { local: false });
    registry.register(NowTool { local: true });
    registry.register(ParseDatetimeTool);
    for (name, amount_key, unit_secs) in [
        ("add_seconds", "seconds", 1.0),
        ("add_minutes", "minutes", 60.0),
        ("add_hours", "hours", 3600.0),
        ("add_days", "days", 86400.0),
    ] {
        registry.register(ShiftTool {
            name,
            amount_key,
            unit_secs,
        });
    }
    for (name, unit, unit_secs) in [
        ("diff_seconds", "seconds", 1.0),
        ("diff_minutes", "minutes", 60.0),
        ("diff_hours", "hours", 3600.0),
    ] {
        registry.register(DiffTool {
            name,
            unit,
            unit_secs,
        });
    }
}

/// A parsed point in time, with or without a UTC offset.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Moment {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

impl Moment {
    fn parse(value: &str) -> std::result::Result<Self, String> {
        let value = value.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Ok(Self::Aware(dt));
        }
        if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
            return Ok(Self::Aware(dt));
        }
        for fmt in NAIVE_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
                return Ok(Self::Naive(dt));
            }
        }
        if let Some(dt) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(Self::Naive(dt));
        }
        Err(format!(
            "Invalid datetime '{}'. Use ISO 8601 or 'YYYY-MM-DD HH:MM:SS'.",
            value
        ))
    }

    fn to_iso(self) -> String {
        match self {
            Self::Aware(dt) => dt.to_rfc3339(),
            Self::Naive(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
        }
    }

    fn shift(self, seconds: f64) -> Option<Self> {
        let ms = seconds * 1000.0;
        if !ms.is_finite() || ms.abs() > i64::MAX as f64 {
            return None;
        }
        let delta = chrono::Duration::try_milliseconds(ms.round() as i64)?;
        match self {
            Self::Aware(dt) => dt.checked_add_signed(delta).map(Self::Aware),
            Self::Naive(dt) => dt.checked_add_signed(delta).map(Self::Naive),
        }
    }

    /// Seconds from `self` to `end`.
    fn seconds_until(self, end: Self) -> std::result::Result<f64, String> {
        let delta = match (self, end) {
            (Self::Aware(a), Self::Aware(b)) => b.signed_duration_since(a),
            (Self::Naive(a), Self::Naive(b)) => b.signed_duration_since(a),
            _ => return Err("Cannot compare a datetime with an offset to one without.".into()),
        };
        Ok(delta.num_milliseconds() as f64 / 1000.0)
    }
}

fn invalid(tool: &str, message: String) -> BraidError {
    BraidError::ToolExecution {
        tool: tool.to_string(),
        message,
    }
}

// ── NowTool ─────────────────────────────────────────────────────

pub struct NowTool {
    local: bool,
}

impl Tool for NowTool {
    fn name(&self) -> &str {
        if self.local {
            "now_local"
        } else {
            "now_utc"
        }
    }
    fn description(&self) -> &str {
        if self.local {
            "Get the current local time (ISO 8601)."
        } else {
            "Get the current time in UTC (ISO 8601)."
        }
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let now = if self.local {
                Local::now().to_rfc3339()
            } else {
                Utc::now().to_rfc3339()
            };
            Ok(ToolResult::success(now))
        })
    }
}

// ── ParseDatetimeTool ───────────────────────────────────────────

pub struct ParseDatetimeTool;

#[derive(Deserialize)]
struct ParseInput {
    value: String,
}

impl Tool for ParseDatetimeTool {
    fn name(&self) -> &str {
        "parse_datetime"
    }
    fn description(&self) -> &str {
        "Parse a datetime string (ISO 8601 or 'YYYY-MM-DD HH:MM:SS') and normalize it to ISO 8601."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "value": { "type": "string", "description": "Datetime string, e.g. '2025-01-01 10:30:00'" }
            },
            "required": ["value"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: ParseInput = serde_json::from_value(input)
                .map_err(|e| BraidError::ToolValidation(e.to_string()))?;
            let moment = Moment::parse(&p.value).map_err(|m| invalid("parse_datetime", m))?;
            Ok(ToolResult::success(moment.to_iso()))
        })
    }
}

// ── ShiftTool (add_*) ───────────────────────────────────────────

pub struct ShiftTool {
    name: &'static str,
    amount_key: &'static str,
    unit_secs: f64,
}

impl Tool for ShiftTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        match self.amount_key {
            "seconds" => "Add seconds (can be negative) to an ISO 8601 datetime.",
            "minutes" => "Add minutes (can be negative) to an ISO 8601 datetime.",
            "hours" => "Add hours (can be negative) to an ISO 8601 datetime.",
            _ => "Add days (can be negative) to an ISO 8601 datetime.",
        }
    }
    fn input_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "time".into(),
            serde_json::json!({ "type": "string", "description": "ISO 8601 datetime" }),
        );
        properties.insert(
            self.amount_key.into(),
            serde_json::json!({ "type": "number", "description": format!("Number of {} to add", self.amount_key) }),
        );
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": ["time", self.amount_key]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let time = input
                .get("time")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BraidError::ToolValidation("missing 'time'".into()))?;
            let amount = input
                .get(self.amount_key)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| {
                    BraidError::ToolValidation(format!("missing numeric '{}'", self.amount_key))
                })?;
            let moment = Moment::parse(time).map_err(|m| invalid(self.name, m))?;
            let shifted = moment
                .shift(amount * self.unit_secs)
                .ok_or_else(|| invalid(self.name, "Resulting datetime is out of range.".into()))?;
            Ok(ToolResult::success(shifted.to_iso()))
        })
    }
}

// ── DiffTool (diff_*) ───────────────────────────────────────────

pub struct DiffTool {
    name: &'static str,
    unit: &'static str,
    unit_secs: f64,
}

#[derive(Deserialize)]
struct DiffInput {
    start: String,
    end: String,
}

impl Tool for DiffTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        match self.unit {
            "seconds" => "Difference between two datetimes in seconds (end - start).",
            "minutes" => "Difference between two datetimes in minutes (end - start).",
            _ => "Difference between two datetimes in hours (end - start).",
        }
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "start": { "type": "string", "description": "Start datetime (ISO 8601)" },
                "end": { "type": "string", "description": "End datetime (ISO 8601)" }
            },
            "required": ["start", "end"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: DiffInput = serde_json::from_value(input)
                .map_err(|e| BraidError::ToolValidation(e.to_string()))?;
            let start = Moment::parse(&p.start).map_err(|m| invalid(self.name, m))?;
            let end = Moment::parse(&p.end).map_err(|m| invalid(self.name, m))?;
            let secs = start
                .seconds_until(end)
                .map_err(|m| invalid(self.name, m))?;
            Ok(ToolResult::success(format_number(secs / self.unit_secs)))
        })
    }
}
