//! Column values and their fixed-width slot encoding.
//!
//! Every value occupies exactly one 8-byte slot:
//! - `Int`: little-endian `i64`
//! - `Text`: UTF-8, at most 8 bytes, padded with NUL
//! - `Bool`: little-endian 0 / 1
//! - `Null`: the bit pattern of `i64::MIN`, which is therefore reserved

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LstoreError, Result};

use super::SLOT_SIZE;

/// Slot bytes that mark a NULL (or never written) value
const NULL_PATTERN: [u8; SLOT_SIZE] = i64::MIN.to_le_bytes();

/// Type of a column, fixed when the table is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Text,
    Bool,
}

impl ValueType {
    /// Tag stored in the page header
    pub fn tag(self) -> u64 {
        match self {
            ValueType::Int => 1,
            ValueType::Text => 2,
            ValueType::Bool => 3,
        }
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(ValueType::Int),
            2 => Some(ValueType::Text),
            3 => Some(ValueType::Bool),
            _ => None,
        }
    }

    /// Parse a user-supplied literal of this type ("_" or "null" is Null)
    pub fn parse(self, literal: &str) -> Result<Value> {
        if literal == "_" || literal.eq_ignore_ascii_case("null") {
            return Ok(Value::Null);
        }
        match self {
            ValueType::Int => literal
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| LstoreError::InvalidValue(format!("{literal:?}: {e}"))),
            ValueType::Text => Ok(Value::Text(literal.to_string())),
            ValueType::Bool => literal
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|e| LstoreError::InvalidValue(format!("{literal:?}: {e}"))),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int => write!(f, "int"),
            ValueType::Text => write!(f, "text"),
            ValueType::Bool => write!(f, "bool"),
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = LstoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(ValueType::Int),
            "text" | "str" | "string" => Ok(ValueType::Text),
            "bool" | "boolean" => Ok(ValueType::Bool),
            other => Err(LstoreError::Schema(format!("unknown column type {other:?}"))),
        }
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Check that this value can be stored in a column of type `ty`
    pub fn check(&self, ty: ValueType) -> Result<()> {
        match (self, ty) {
            (Value::Null, _) => Ok(()),
            (Value::Int(i64::MIN), ValueType::Int) => Err(LstoreError::InvalidValue(
                "i64::MIN is reserved for NULL".to_string(),
            )),
            (Value::Int(_), ValueType::Int) | (Value::Bool(_), ValueType::Bool) => Ok(()),
            (Value::Text(s), ValueType::Text) => {
                if s.len() > SLOT_SIZE {
                    Err(LstoreError::InvalidValue(format!(
                        "text {s:?} is {} bytes, slots hold {SLOT_SIZE}",
                        s.len()
                    )))
                } else if s.as_bytes().contains(&0) {
                    Err(LstoreError::InvalidValue(format!(
                        "text {s:?} contains a NUL byte"
                    )))
                } else {
                    Ok(())
                }
            }
            (value, ty) => Err(LstoreError::InvalidValue(format!(
                "{value} does not fit a {ty} column"
            ))),
        }
    }

    /// Encode into one slot
    pub fn encode(&self, ty: ValueType) -> Result<[u8; SLOT_SIZE]> {
        self.check(ty)?;
        Ok(match self {
            Value::Null => NULL_PATTERN,
            Value::Int(v) => v.to_le_bytes(),
            Value::Bool(b) => (*b as i64).to_le_bytes(),
            Value::Text(s) => {
                let mut slot = [0u8; SLOT_SIZE];
                slot[..s.len()].copy_from_slice(s.as_bytes());
                slot
            }
        })
    }

    /// Decode one slot written for a column of type `ty`
    pub fn decode(slot: [u8; SLOT_SIZE], ty: ValueType) -> Result<Value> {
        if slot == NULL_PATTERN {
            return Ok(Value::Null);
        }
        match ty {
            ValueType::Int => Ok(Value::Int(i64::from_le_bytes(slot))),
            ValueType::Bool => Ok(Value::Bool(i64::from_le_bytes(slot) != 0)),
            ValueType::Text => {
                let end = slot.iter().position(|&b| b == 0).unwrap_or(SLOT_SIZE);
                std::str::from_utf8(&slot[..end])
                    .map(|s| Value::Text(s.to_string()))
                    .map_err(|e| LstoreError::CorruptPage(format!("text slot is not UTF-8: {e}")))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
