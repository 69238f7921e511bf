//! File prefix templating.
//!
//! Prefixes such as `{uid}-` or `{plan_name}-{scan_id}-` are resolved against the
//! top-level fields of the run-start document.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ExportError, ExportResult};
use crate::experiment::RunStart;

/// Render `template` against `start` and make the result safe to use in a file name.
pub fn render_prefix(template: &str, start: &RunStart) -> ExportResult<String> {
    let vars = template_vars(start);
    let rendered = strfmt::strfmt(template, &vars).map_err(|e| ExportError::Template {
        template: template.to_string(),
        reason: e.to_string(),
    })?;
    Ok(sanitize_file_name(&rendered))
}

fn template_vars(start: &RunStart) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = start
        .extra
        .iter()
        .map(|(key, value)| (key.clone(), value_text(value)))
        .collect();
    vars.insert("uid".to_string(), start.uid.clone());
    vars.insert("time".to_string(), start.time.to_string());
    vars
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace characters that would escape the destination directory.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}
