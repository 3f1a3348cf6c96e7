//! Query builder for the file backend.
//!
//! Key names may be structured as dot-separated parts, e.g. a user keyed as
//! `<Skey>.<Email>`. A query that declares those parts can filter on them
//! from the file name alone:
//!
//! ```text
//! let mut q = store.new_query("User", false, &["Skey", "Email"]);
//! q.filter("Skey =", 671314941988i64.into())?;
//! q.filter("Email =", "test@example.com".into())?;
//! ```
//!
//! All but the last part must be free of dots. A filter on any other field
//! via `filter_field` falls back to reading each candidate entity.

use std::any::Any;
use std::cmp::Ordering;

use crate::error::{StoreError, StoreResult};
use crate::key::{EPOCH_START, MAX_KEYS, SUB_TIME_BITS};
use crate::query::{parse_operator, split_filter, FieldFilter, Query};
use crate::value::{Operator, Value};

/// Operand of a key-part comparison.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Str(String),
    Int(i64),
}

/// One comparison applied to a key part.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PartCmp {
    pub op: Operator,
    pub operand: Operand,
}

impl PartCmp {
    /// Numeric comparisons fail on parts that are not integers.
    fn matches(&self, part: &str) -> bool {
        match &self.operand {
            Operand::Str(s) => self.op.accepts(part.cmp(s.as_str())),
            Operand::Int(n) => part.parse::<i64>().is_ok_and(|p| self.op.accepts(p.cmp(n))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileQuery {
    pub(crate) kind: String,
    pub(crate) keys_only: bool,
    pub(crate) ordered: bool,
    /// Set by the first key-part filter; from then on names must split into
    /// exactly `key_parts.len()` parts.
    pub(crate) filtering: bool,
    pub(crate) key_parts: Vec<String>,
    pub(crate) cmp: Vec<Vec<PartCmp>>,
    pub(crate) limit: usize,
    pub(crate) offset: usize,
    pub(crate) field_filters: Vec<FieldFilter>,
}

impl FileQuery {
    pub fn new(kind: &str, keys_only: bool, key_parts: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            keys_only,
            ordered: false,
            filtering: false,
            key_parts: key_parts.iter().map(|p| p.to_string()).collect(),
            cmp: vec![Vec::new(); key_parts.len()],
            limit: MAX_KEYS,
            offset: 0,
            field_filters: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn keys_only(&self) -> bool {
        self.keys_only
    }

    fn part_index(&self, field: &str) -> Option<usize> {
        self.key_parts.iter().position(|p| p == field)
    }

    /// Whether the key name passes every key-part comparison.
    pub(crate) fn matches_name(&self, name: &str) -> bool {
        if !self.filtering || self.key_parts.is_empty() {
            return true;
        }
        let parts: Vec<&str> = name.splitn(self.key_parts.len(), '.').collect();
        if parts.len() != self.key_parts.len() {
            return false;
        }
        parts.iter().zip(&self.cmp).all(|(part, cmps)| cmps.iter().all(|c| c.matches(part)))
    }

    pub(crate) fn has_field_filters(&self) -> bool {
        !self.field_filters.is_empty()
    }
}

/// Applies the `ID`/`MID` and `Timestamp` transforms to a numeric operand.
fn transform(field: &str, n: i64) -> i64 {
    match field {
        "ID" | "MID" => n & 0xffff_ffff,
        "Timestamp" => n.saturating_sub(EPOCH_START).wrapping_shl(SUB_TIME_BITS),
        _ => n,
    }
}

impl Query for FileQuery {
    /// Filters on a declared key part.
    ///
    /// `ID` and `MID` values are reduced to their low 32 bits and
    /// `Timestamp` values are re-based onto the store epoch, matching how
    /// such parts are written into key names.
    fn filter(&mut self, filter: &str, value: Value) -> StoreResult<()> {
        self.filtering = true;

        let (field, rest) = split_filter(filter)?;
        let idx = self
            .part_index(field)
            .ok_or_else(|| StoreError::InvalidField(field.to_string()))?;
        let op = parse_operator(filter, rest)?;

        let operand = match value {
            Value::Null => return Ok(()),
            Value::Str(s) => Operand::Str(s),
            Value::Int(n) => Operand::Int(transform(field, n)),
            Value::UInt(u) => {
                let n = i64::try_from(u).map_err(|_| StoreError::InvalidValue(field.to_string()))?;
                Operand::Int(transform(field, n))
            }
            _ => return Err(StoreError::InvalidValue(field.to_string())),
        };
        self.cmp[idx].push(PartCmp { op, operand });
        Ok(())
    }

    /// Filters on a key part when `field` is one, otherwise on the decoded
    /// entity's field value.
    fn filter_field(&mut self, field: &str, operator: &str, value: Value) -> StoreResult<()> {
        let op = Operator::parse(operator)?;
        if self.part_index(field).is_some() {
            return self.filter(&format!("{field} {op}"), value);
        }
        if value.is_null() {
            return Ok(());
        }
        self.field_filters.push(FieldFilter::new(field, op, value));
        Ok(())
    }

    /// Orders by numeric id, then by name. The field is ignored.
    fn order(&mut self, _field: &str) {
        self.ordered = true;
    }

    fn limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    fn offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sort order used when a file query is ordered.
pub(crate) fn by_id_then_name(a: &crate::key::Key, b: &crate::key::Key) -> Ordering {
    a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_query() -> FileQuery {
        FileQuery::new("User", false, &["ID", "Email"])
    }

    #[test]
    fn string_and_int_filters_match_parts() {
        let mut q = user_query();
        q.filter("Email =", "bar@example.com".into()).unwrap();
        assert!(q.matches_name("20.bar@example.com"));
        assert!(!q.matches_name("10.foo@example.com"));

        let mut q = user_query();
        q.filter("ID =", Value::Int(10)).unwrap();
        assert!(q.matches_name("10.foo@example.com"));
        assert!(!q.matches_name("20.bar@example.com"));
    }

    #[test]
    fn last_part_keeps_its_dots() {
        let mut q = FileQuery::new("Site", false, &["Skey", "Host"]);
        q.filter("Host =", "a.b.c".into()).unwrap();
        assert!(q.matches_name("7.a.b.c"));
        assert!(!q.matches_name("7"));
    }

    #[test]
    fn stacked_comparisons_are_anded() {
        let mut q = user_query();
        q.filter("ID >=", Value::Int(10)).unwrap();
        q.filter("ID <", Value::Int(20)).unwrap();
        assert!(q.matches_name("10.a"));
        assert!(q.matches_name("19.a"));
        assert!(!q.matches_name("20.a"));
        assert!(!q.matches_name("x.a"));
    }

    #[test]
    fn string_less_than_is_strict() {
        let mut q = user_query();
        q.filter("Email <", "m".into()).unwrap();
        assert!(q.matches_name("1.a"));
        assert!(!q.matches_name("1.z"));
    }

    #[test]
    fn ids_are_masked_and_timestamps_rebased() {
        let mut q = user_query();
        q.filter("ID =", Value::Int((5 << 32) | 10)).unwrap();
        assert!(q.matches_name("10.x"));

        let mut q = FileQuery::new("Signal", false, &["MID", "Timestamp"]);
        q.filter("Timestamp =", Value::Int(EPOCH_START + 2)).unwrap();
        assert!(q.matches_name("3.16"));
    }

    #[test]
    fn null_is_a_wildcard_but_still_demands_structure() {
        let mut q = user_query();
        q.filter("Email =", Value::Null).unwrap();
        assert!(q.matches_name("1.anything"));
        assert!(!q.matches_name("nodots"));
    }

    #[test]
    fn errors_come_in_order() {
        let mut q = user_query();
        assert!(matches!(q.filter("Email", "x".into()), Err(StoreError::InvalidFilter(_))));
        assert!(matches!(q.filter("Name =", "x".into()), Err(StoreError::InvalidField(_))));
        assert!(matches!(q.filter("Email ", "x".into()), Err(StoreError::OperatorMissing(_))));
        assert!(matches!(q.filter("Email !", "x".into()), Err(StoreError::InvalidOperator(_))));
        assert!(matches!(q.filter("Email !=", "x".into()), Err(StoreError::InvalidOperator(_))));
        assert!(matches!(q.filter("Email =<", "x".into()), Err(StoreError::InvalidOperator(_))));
        assert!(matches!(q.filter("Email =", Value::Bool(true)), Err(StoreError::InvalidValue(_))));
        assert!(matches!(
            q.filter("ID =", Value::UInt(u64::MAX)),
            Err(StoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn filter_field_routes_key_parts_and_fields() {
        let mut q = user_query();
        q.filter_field("Email", "=", "a@b".into()).unwrap();
        assert_eq!(q.cmp[1].len(), 1);
        assert!(!q.has_field_filters());

        q.filter_field("Age", ">=", Value::Int(30)).unwrap();
        q.filter_field("Nick", "=", Value::Null).unwrap();
        assert_eq!(q.field_filters, vec![FieldFilter::new("Age", Operator::Ge, Value::Int(30))]);

        assert!(matches!(
            q.filter_field("Age", "!=", Value::Int(1)),
            Err(StoreError::InvalidOperator(_))
        ));
    }

    #[test]
    fn not_equal_is_rejected_on_key_parts_too() {
        let mut q = user_query();
        let err = q.filter_field("Email", "!=", "bar@example.com".into()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperator(ref op) if op == "!="));
        assert!(q.cmp.iter().all(Vec::is_empty));
        assert!(q.matches_name("20.bar@example.com"));
    }
}
