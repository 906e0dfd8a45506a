//! Suspension steps: `sleep` and `wait_for_input`.

use serde_json::{Value, json};
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::expressions;
use crate::transition::Cursor;

use super::super::{Error, Result};
use super::Outcome;

/// Parse an ISO 8601 time duration (`PT5S`, `PT1M30S`, `PT0.5S`).
///
/// Only time components are supported; date components would need
/// calendar arithmetic.
pub fn parse_iso8601_duration(iso_str: &str) -> Result<Duration> {
    let trimmed = iso_str.trim();

    let invalid = |message: String| Error::StepExecution { message };

    let Some(without_p) = trimmed.strip_prefix('P') else {
        return Err(invalid(format!(
            "Invalid ISO 8601 duration: must start with 'P', got: {iso_str}"
        )));
    };

    let Some(time_part) = without_p.strip_prefix('T') else {
        return Err(invalid(format!(
            "Only time components (PT...) are supported in durations, got: {iso_str}"
        )));
    };

    if time_part.is_empty() {
        return Err(invalid(format!(
            "Invalid ISO 8601 duration: no time components, got: {iso_str}"
        )));
    }

    let mut total_ms: f64 = 0.0;
    let mut current_num = String::new();

    for ch in time_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            current_num.push(ch);
        } else {
            if current_num.is_empty() {
                return Err(invalid(format!("Invalid ISO 8601 duration: {iso_str}")));
            }
            let value: f64 = current_num.parse().map_err(|_| {
                invalid(format!(
                    "Failed to parse number in ISO 8601 duration: {current_num}"
                ))
            })?;
            match ch {
                'H' => total_ms += value * 3600.0 * 1000.0,
                'M' => total_ms += value * 60.0 * 1000.0,
                'S' => total_ms += value * 1000.0,
                _ => {
                    return Err(invalid(format!("Unsupported ISO 8601 time unit: {ch}")));
                }
            }
            current_num.clear();
        }
    }

    if !current_num.is_empty() {
        return Err(invalid(format!(
            "Trailing number without unit in ISO 8601 duration: {iso_str}"
        )));
    }

    Ok(Duration::from_millis(total_ms as u64))
}

pub fn exec_sleep(duration: &str) -> Result<Outcome> {
    let duration = parse_iso8601_duration(duration)?;
    Ok(Outcome::Sleep { duration })
}

pub async fn exec_wait_for_input(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    info: &str,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let rendered = expressions::render(info, &scope)?;
    Ok(Outcome::AwaitInput {
        info: if rendered.is_empty() {
            Value::Null
        } else {
            json!(rendered)
        },
    })
}
