//! Helpers for reading a finished trace archive.

#![allow(dead_code)]

use std::path::Path;

use serde_json::Value;

pub fn read_json_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
        .lines()
        .map(|line| serde_json::from_str(line).expect("invalid JSON line"))
        .collect()
}

pub fn read_json(path: &Path) -> Value {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
    serde_json::from_str(&content).expect("invalid JSON document")
}

/// Global definitions of `kind`.
pub fn definitions<'a>(defs: &'a [Value], kind: &str) -> Vec<&'a Value> {
    defs.iter().filter(|d| d["kind"] == kind).collect()
}

/// Value of the string definition with reference `id`.
pub fn string<'a>(defs: &'a [Value], id: &Value) -> &'a str {
    defs.iter()
        .find(|d| d["kind"] == "string" && d["ref"] == *id)
        .and_then(|d| d["value"].as_str())
        .unwrap_or_else(|| panic!("no string {id}"))
}
