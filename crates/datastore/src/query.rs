//! The query contract shared by the file and cloud backends.
//!
//! Queries are mutable builders: each call refines the query in place, and
//! `Store::get_all` executes its final state. A `Null` value is a wildcard
//! and leaves the query unconstrained on that field.

use std::any::Any;

use crate::error::{StoreError, StoreResult};
use crate::value::{Operator, Value};

pub trait Query: Send + Sync {
    /// Adds a filter written as `"<field> <op>"`, e.g. `"Email ="`.
    fn filter(&mut self, filter: &str, value: Value) -> StoreResult<()>;

    /// Adds a filter on `field` with an operator in `=, <, >, <=, >=`.
    fn filter_field(&mut self, field: &str, operator: &str, value: Value) -> StoreResult<()>;

    /// Requests ordered results.
    fn order(&mut self, field: &str);

    /// Caps the number of results.
    fn limit(&mut self, limit: usize);

    /// Skips this many results before returning any.
    fn offset(&mut self, offset: usize);

    /// Lets a backend recover its own concrete query type.
    fn as_any(&self) -> &dyn Any;
}

/// A filter evaluated against entity field values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// Splits a legacy filter string into its field name and the remainder that
/// should hold the operator.
///
/// The field ends at the first space or operator character; a string with
/// neither is `InvalidFilter`.
pub fn split_filter(filter: &str) -> StoreResult<(&str, &str)> {
    let pos = filter
        .find(|c: char| c == ' ' || c == '=' || c == '<' || c == '>')
        .ok_or_else(|| StoreError::InvalidFilter(filter.to_string()))?;
    Ok((&filter[..pos], &filter[pos..]))
}

/// Parses the operator part of a legacy filter string. The whole trimmed
/// remainder must be one operator, so `"Email !="` is `InvalidOperator`.
pub fn parse_operator(filter: &str, rest: &str) -> StoreResult<Operator> {
    let op = rest.trim();
    if op.is_empty() {
        return Err(StoreError::OperatorMissing(filter.to_string()));
    }
    Operator::parse(op)
}

/// Parses `"<field> <op>"` in one step.
pub fn parse_filter(filter: &str) -> StoreResult<(&str, Operator)> {
    let (field, rest) = split_filter(filter)?;
    let op = parse_operator(filter, rest)?;
    Ok((field, op))
}
