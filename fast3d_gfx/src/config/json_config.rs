//! Persisted JSON configuration store
//!
//! Keys are dot-separated paths into a JSON document ("Window.Backend.Name").
//! A segment made only of digits indexes an array when the container at that
//! point is an array (or has to be created). Typed getters never fail: a
//! missing key, a key of another type or an empty string yields the caller's
//! default.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

const SOURCE: &str = "fast3d::config";

pub struct JsonConfig {
    path: PathBuf,
    root: Value,
    is_new: bool,
}

impl JsonConfig {
    /// Load the store at `path`; an absent or unparsable file starts empty
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match load_document(&path) {
            Some(root) => Self { path, root, is_new: false },
            None => Self {
                path,
                root: Value::Object(Map::new()),
                is_new: true,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until the store has been written once
    pub fn is_new_config(&self) -> bool {
        self.is_new
    }

    /// Raw JSON value at `key` (null counts as absent)
    pub fn get_raw_entry(&self, key: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in key.split('.') {
            current = child(current, segment)?;
        }
        (!current.is_null()).then_some(current)
    }

    pub fn get_integer(&self, key: &str, default: i32) -> i32 {
        self.get_raw_entry(key)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(default)
    }

    pub fn get_uinteger(&self, key: &str, default: u32) -> u32 {
        self.get_raw_entry(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        self.get_raw_entry(key)
            .filter(|v| v.is_f64())
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw_entry(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_boolean(&self, key: &str, default: bool) -> bool {
        self.get_raw_entry(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Store a value, creating intermediate objects and arrays
    pub fn set_raw_entry(&mut self, key: &str, value: Value) {
        let mut current = &mut self.root;
        for segment in key.split('.') {
            current = entry_mut(current, segment);
        }
        *current = value;
    }

    pub fn set_integer(&mut self, key: &str, value: i32) {
        self.set_raw_entry(key, Value::from(value));
    }

    pub fn set_uinteger(&mut self, key: &str, value: u32) {
        self.set_raw_entry(key, Value::from(value));
    }

    /// Non-finite floats are stored as null
    pub fn set_float(&mut self, key: &str, value: f32) {
        self.set_raw_entry(key, Value::from(value as f64));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set_raw_entry(key, Value::from(value));
    }

    pub fn set_boolean(&mut self, key: &str, value: bool) {
        self.set_raw_entry(key, Value::from(value));
    }

    /// Remove `key`, then every ancestor left empty by the removal
    pub fn delete_entry(&mut self, key: &str) {
        let segments: Vec<&str> = key.split('.').collect();
        for depth in (1..=segments.len()).rev() {
            let Some(parent) = lookup_mut(&mut self.root, &segments[..depth - 1]) else {
                return;
            };
            let segment = segments[depth - 1];
            if depth < segments.len() && !child(parent, segment).is_some_and(is_empty_container) {
                return;
            }
            if !remove_child(parent, segment) {
                return;
            }
        }
    }

    /// Write the document as pretty JSON (4-space indent)
    pub fn persist_to_disk(&mut self) -> Result<()> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.root.serialize(&mut serializer).map_err(|e| {
            crate::engine_error!(SOURCE, "Failed to serialize {}: {}", self.path.display(), e);
            Error::ConfigError(format!("serialize {}: {}", self.path.display(), e))
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
        }
        fs::write(&self.path, buffer).map_err(|e| io_error(&self.path, e))?;

        self.is_new = false;
        crate::engine_debug!(SOURCE, "Saved {}", self.path.display());
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    crate::engine_error!(SOURCE, "Failed to write {}: {}", path.display(), e);
    Error::ConfigError(format!("write {}: {}", path.display(), e))
}

fn load_document(path: &Path) -> Option<Value> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            crate::engine_info!(SOURCE, "No configuration at {}, starting empty", path.display());
            return None;
        }
        Err(e) => {
            crate::engine_error!(SOURCE, "Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(root @ Value::Object(_)) => Some(root),
        Ok(_) => {
            crate::engine_error!(SOURCE, "{} does not hold a JSON object", path.display());
            None
        }
        Err(e) => {
            crate::engine_error!(SOURCE, "Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

/// All-digit segments are array indices
fn array_index(segment: &str) -> Option<usize> {
    if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
        segment.parse().ok()
    } else {
        None
    }
}

fn child<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match (value, array_index(segment)) {
        (Value::Array(items), Some(index)) => items.get(index),
        (Value::Object(map), _) => map.get(segment),
        _ => None,
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match (value, array_index(segment)) {
        (Value::Array(items), Some(index)) => items.get_mut(index),
        (Value::Object(map), _) => map.get_mut(segment),
        _ => None,
    }
}

fn lookup_mut<'a>(root: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path {
        current = child_mut(current, segment)?;
    }
    Some(current)
}

/// Child slot for writing; nulls and scalars in the way become containers
fn entry_mut<'a>(value: &'a mut Value, segment: &str) -> &'a mut Value {
    if let Some(index) = array_index(segment) {
        if value.is_null() {
            *value = Value::Array(Vec::new());
        }
        if value.is_array() {
            if let Value::Array(items) = &mut *value {
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
            }
            return &mut value[index];
        }
    }
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    &mut value[segment]
}

fn remove_child(parent: &mut Value, segment: &str) -> bool {
    match (parent, array_index(segment)) {
        (Value::Array(items), Some(index)) if index < items.len() => {
            items.remove(index);
            true
        }
        (Value::Object(map), _) => map.remove(segment).is_some(),
        _ => false,
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
