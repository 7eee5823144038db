//! Configuration node wrapper
//!
//! Device, platform and sink sections are kept as raw TOML tables and read
//! lazily through [`ConfigNode`], so a missing or malformed field fails only
//! the unit that owns it. Every error carries the dotted path of the field,
//! e.g. `sensor.mqtt[1].topic`.

use std::fmt;
use std::time::Duration;

use toml::{Table, Value};

use crate::error::CoreError;

/// A TOML table annotated with its position in the configuration tree
#[derive(Debug, Clone)]
pub struct ConfigNode {
    path: String,
    table: Table,
}

impl ConfigNode {
    pub fn new(path: impl Into<String>, table: Table) -> Self {
        Self {
            path: path.into(),
            table,
        }
    }

    /// Parse a whole configuration file into a root node
    pub fn parse(path: impl Into<String>, content: &str) -> Result<Self, CoreError> {
        let table: Table = content.parse()?;
        Ok(Self::new(path, table))
    }

    /// Dotted path of this node
    pub fn path(&self) -> &str {
        &self.path
    }

    fn field_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    /// Required string field; empty strings count as missing
    pub fn require_str(&self, key: &str) -> Result<String, CoreError> {
        match self.get_str(key)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(CoreError::missing(self.field_path(key))),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<String>, CoreError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.wrong_type(key, "a string", other)),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, CoreError> {
        match self.table.get(key) {
            None => Ok(default),
            Some(Value::Boolean(b)) => Ok(*b),
            Some(other) => Err(self.wrong_type(key, "a boolean", other)),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, CoreError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::Integer(i)) => Ok(Some(*i)),
            Some(other) => Err(self.wrong_type(key, "an integer", other)),
        }
    }

    /// Numeric field accepting both integers and floats
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, CoreError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::Integer(i)) => Ok(Some(*i as f64)),
            Some(Value::Float(f)) => Ok(Some(*f)),
            Some(other) => Err(self.wrong_type(key, "a number", other)),
        }
    }

    /// Duration in seconds; must be finite and not negative
    pub fn get_secs(&self, key: &str) -> Result<Option<Duration>, CoreError> {
        let Some(secs) = self.get_f64(key)? else {
            return Ok(None);
        };
        Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            CoreError::InvalidConfig(format!(
                "`{}` value `{}` is not a valid number of seconds",
                self.field_path(key),
                secs
            ))
        })
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, CoreError> {
        self.get_f64(key)?
            .ok_or_else(|| CoreError::missing(self.field_path(key)))
    }

    /// Required integer that may also be written as a numeric string (`"3"`)
    pub fn require_index(&self, key: &str) -> Result<i64, CoreError> {
        match self.table.get(key) {
            None => Err(CoreError::missing(self.field_path(key))),
            Some(Value::Integer(i)) => Ok(*i),
            Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| {
                CoreError::InvalidConfig(format!(
                    "`{}` value `{}` cannot be converted to integer",
                    self.field_path(key),
                    s
                ))
            }),
            Some(other) => Err(self.wrong_type(key, "an integer", other)),
        }
    }

    /// Nested table
    pub fn get_node(&self, key: &str) -> Result<Option<ConfigNode>, CoreError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::Table(t)) => Ok(Some(ConfigNode::new(self.field_path(key), t.clone()))),
            Some(other) => Err(self.wrong_type(key, "a table", other)),
        }
    }

    /// List of tables; an absent key is an empty list
    pub fn get_list(&self, key: &str) -> Result<Vec<ConfigNode>, CoreError> {
        let path = self.field_path(key);
        match self.table.get(key) {
            None => Ok(Vec::new()),
            Some(Value::String(_)) => Err(CoreError::InvalidConfig(format!(
                "`{}` must be a list, not a string",
                path
            ))),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Table(t) => Ok(ConfigNode::new(format!("{}[{}]", path, i), t.clone())),
                    _ => Err(CoreError::InvalidConfig(format!(
                        "`{}[{}]` must be a table",
                        path, i
                    ))),
                })
                .collect(),
            Some(_) => Err(CoreError::InvalidConfig(format!(
                "`{}` must be a list",
                path
            ))),
        }
    }

    fn wrong_type(&self, key: &str, expected: &str, actual: &Value) -> CoreError {
        CoreError::InvalidConfig(format!(
            "`{}` must be {}, got {}",
            self.field_path(key),
            expected,
            actual.type_str()
        ))
    }
}

impl fmt::Display for ConfigNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.path)?;
        for (i, (key, value)) in self.table.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {} = {}", key, value)?;
        }
        write!(f, " }}")
    }
}
