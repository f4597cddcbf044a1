//! Parser for the `--info` report printed by a compiled instrument.
//!
//! The report looks like YAML but is not: keys lack spaces after colons,
//! values are unquoted free text, `Parameters:` is a space separated list,
//! sections are delimited by `begin NAME` / `end NAME`, and `Param:` repeats.
//! [`to_yaml`] rewrites it into real YAML in a fixed sequence of passes,
//! then `serde_yaml` does the parsing.
//
//  Passes, each over the whole text:
//
//      1. `Parameters: a b c`      → `Parameters: [a,b,c]`  (`[]` when blank)
//      2. `label:value`            → `label: value`
//      3. `label: free text`       → `label: "free text"`   (lists untouched)
//      4. `begin NAME` … `end NAME` → `NAME:` with the interior nested below
//      5. `Param: "…"` (n-th)       → `Param<n>: "…"`         (n from 0)
pub mod detector;

pub use detector::{Detector, Statistics};

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Structured form of a diagnostic report.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticReport {
    root: Mapping,
}

impl DiagnosticReport {
    pub fn parse(raw: &str) -> Result<Self> {
        let yaml = to_yaml(raw)?;
        let value: Value =
            serde_yaml::from_str(&yaml).map_err(|e| Error::ReportFormat(e.to_string()))?;
        match value {
            Value::Mapping(root) => Ok(Self { root }),
            other => Err(Error::ReportFormat(format!(
                "expected a mapping at top level, got {}",
                kind(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn simulation(&self) -> Option<&Value> {
        self.get("simulation")
    }

    pub fn instrument(&self) -> Option<&Value> {
        self.get("instrument")
    }

    /// Names listed on the first `Parameters:` line, wherever it is nested.
    pub fn parameters(&self) -> Vec<String> {
        find_key(&self.root, "Parameters")
            .and_then(Value::as_sequence)
            .map(|seq| seq.iter().map(scalar_string).collect())
            .unwrap_or_default()
    }

    /// Values of `Param0`, `Param1`, … in report order.
    pub fn params(&self) -> Vec<String> {
        let Some(owner) = find_owner(&self.root, "Param0") else {
            return Vec::new();
        };
        (0..)
            .map_while(|i| owner.get(format!("Param{i}").as_str()))
            .map(scalar_string)
            .collect()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.root).map_err(|e| Error::ReportFormat(e.to_string()))
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "nothing",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Depth-first lookup of `key` in nested mappings.
fn find_key<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    find_owner(map, key).and_then(|m| m.get(key))
}

/// The mapping that directly contains `key`.
fn find_owner<'a>(map: &'a Mapping, key: &str) -> Option<&'a Mapping> {
    if map.contains_key(key) {
        return Some(map);
    }
    map.values()
        .filter_map(Value::as_mapping)
        .find_map(|m| find_owner(m, key))
}

// ─────────────────────────────────────────────────────
// Text rewrites
// ─────────────────────────────────────────────────────

/// Rewrite a raw report into YAML.
pub fn to_yaml(raw: &str) -> Result<String> {
    let text = map_lines(raw, parameters_to_list);
    let text = map_lines(&text, normalize_separator);
    let text = map_lines(&text, quote_value);
    let text = collapse_blocks(&text)?;
    Ok(number_params(&text))
}

fn map_lines(text: &str, f: fn(&str) -> String) -> String {
    text.lines().map(f).collect::<Vec<_>>().join("\n")
}

fn split_indent(line: &str) -> (&str, &str) {
    let body = line.trim_start();
    (&line[..line.len() - body.len()], body)
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn parameters_to_list(line: &str) -> String {
    let (indent, body) = split_indent(line);
    let Some(rest) = body.strip_prefix("Parameters:") else {
        return line.to_string();
    };
    let names: Vec<&str> = rest.split_whitespace().collect();
    format!("{indent}Parameters: [{}]", names.join(","))
}

fn normalize_separator(line: &str) -> String {
    let Some(pos) = line.find(':') else {
        return line.to_string();
    };
    let (label, after) = (&line[..pos], &line[pos + 1..]);
    if label.trim().is_empty() || after.is_empty() {
        return line.to_string();
    }
    let value = after.trim_start();
    if value.is_empty() {
        format!("{label}:")
    } else {
        format!("{label}: {value}")
    }
}

/// Name closed by an `end NAME` line. A line like `end time: 5` is a field.
fn end_marker(body: &str) -> Option<&str> {
    let name = body.strip_prefix("end ")?.trim();
    let is_name = !name.is_empty() && !name.contains(':') && !name.contains(char::is_whitespace);
    is_name.then_some(name)
}

fn is_block_marker(body: &str) -> bool {
    body.starts_with("begin ") || end_marker(body).is_some()
}

fn quote_value(line: &str) -> String {
    let (_, body) = split_indent(line);
    if is_block_marker(body) {
        return line.to_string();
    }
    let Some(pos) = line.find(':') else {
        return line.to_string();
    };
    let (label, value) = (&line[..pos], line[pos + 1..].trim());
    if label.trim().is_empty() || value.is_empty() || value.starts_with('[') {
        return line.to_string();
    }
    format!("{label}: \"{}\"", escape(value))
}

fn collapse_blocks(text: &str) -> Result<String> {
    let mut open: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();

    for line in text.lines() {
        let (indent, body) = split_indent(line);

        if let Some(rest) = body.strip_prefix("begin ") {
            let mut words = rest.split_whitespace();
            let name = words
                .next()
                .map(|w| w.trim_end_matches(':'))
                .filter(|w| !w.is_empty())
                .ok_or_else(|| Error::ReportFormat(format!("unnamed block: `{line}`")))?;

            let after_name = rest.trim_start()[name.len()..].trim_start_matches(':');
            let closing = format!("end {name}");
            if let Some(end) = after_name.find(&closing) {
                // whole block on one line: the interior is a literal value
                let interior = after_name[..end].trim();
                out.push(format!("{indent}{name}: \"{}\"", escape(interior)));
            } else {
                out.push(format!("{indent}{name}:"));
                open.push(name.to_string());
            }
            continue;
        }

        if let Some(name) = end_marker(body) {
            if open.last().map(String::as_str) == Some(name) {
                open.pop();
                continue;
            }
            return Err(Error::ReportFormat(format!(
                "`{}` does not close an open block",
                body.trim_end()
            )));
        }

        out.push(line.to_string());
    }

    match open.last() {
        Some(name) => Err(Error::ReportFormat(format!("block `{name}` is never closed"))),
        None => Ok(out.join("\n")),
    }
}

fn number_params(text: &str) -> String {
    let mut next = 0usize;
    text.lines()
        .map(|line| {
            let (indent, body) = split_indent(line);
            match body.strip_prefix("Param:") {
                Some(rest) if rest.starts_with(char::is_whitespace)
                    && rest.trim_start().starts_with('"') =>
                {
                    let numbered = format!("{indent}Param{next}:{rest}");
                    next += 1;
                    numbered
                }
                _ => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
