//! Table schema: column types and the key column.

use serde::{Deserialize, Serialize};

use crate::error::{LstoreError, Result};
use crate::page::{Value, ValueType, MAX_COLUMNS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    column_types: Vec<ValueType>,
    key_column: usize,
}

impl Schema {
    pub fn new(column_types: Vec<ValueType>, key_column: usize) -> Result<Self> {
        if column_types.is_empty() {
            return Err(LstoreError::Schema("a table needs at least one column".to_string()));
        }
        if column_types.len() > MAX_COLUMNS {
            return Err(LstoreError::Schema(format!(
                "{} columns requested, at most {} supported",
                column_types.len(),
                MAX_COLUMNS
            )));
        }
        if key_column >= column_types.len() {
            return Err(LstoreError::Schema(format!(
                "key column {} out of range for {} columns",
                key_column,
                column_types.len()
            )));
        }
        Ok(Self {
            column_types,
            key_column,
        })
    }

    pub fn column_types(&self) -> &[ValueType] {
        &self.column_types
    }

    pub fn num_columns(&self) -> usize {
        self.column_types.len()
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    pub fn check_column(&self, column: usize) -> Result<()> {
        if column >= self.column_types.len() {
            return Err(LstoreError::Schema(format!(
                "column {} out of range for {} columns",
                column,
                self.column_types.len()
            )));
        }
        Ok(())
    }

    /// Validate a full row for insertion: arity, types and a non-null key
    pub fn check_row(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.column_types.len() {
            return Err(LstoreError::InvalidValue(format!(
                "expected {} values, got {}",
                self.column_types.len(),
                values.len()
            )));
        }
        for (value, ty) in values.iter().zip(&self.column_types) {
            value.check(*ty)?;
        }
        if values[self.key_column].is_null() {
            return Err(LstoreError::InvalidValue("key column cannot be NULL".to_string()));
        }
        Ok(())
    }
}
