use std::any::Any;

use crate::error::StoreResult;
use crate::query::{parse_filter, FieldFilter, Query};
use crate::value::{Operator, Value};

/// Sort direction of an order clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Query for the cloud backend. Filters, ordering and pagination are all
/// executed by the database; key parts are not used.
#[derive(Debug, Clone)]
pub struct CloudQuery {
    kind: String,
    keys_only: bool,
    filters: Vec<FieldFilter>,
    orders: Vec<(String, Direction)>,
    limit: Option<usize>,
    offset: usize,
}

impl CloudQuery {
    pub fn new(kind: &str, keys_only: bool) -> Self {
        Self {
            kind: kind.to_string(),
            keys_only,
            filters: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn keys_only(&self) -> bool {
        self.keys_only
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn orders(&self) -> &[(String, Direction)] {
        &self.orders
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset_value(&self) -> usize {
        self.offset
    }
}

impl Query for CloudQuery {
    fn filter(&mut self, filter: &str, value: Value) -> StoreResult<()> {
        let (field, op) = parse_filter(filter)?;
        if !value.is_null() {
            self.filters.push(FieldFilter::new(field, op, value));
        }
        Ok(())
    }

    fn filter_field(&mut self, field: &str, operator: &str, value: Value) -> StoreResult<()> {
        let op = Operator::parse(operator)?;
        if !value.is_null() {
            self.filters.push(FieldFilter::new(field, op, value));
        }
        Ok(())
    }

    /// A leading `-` sorts descending.
    fn order(&mut self, field: &str) {
        let order = match field.strip_prefix('-') {
            Some(f) => (f.trim().to_string(), Direction::Descending),
            None => (field.trim().to_string(), Direction::Ascending),
        };
        self.orders.push(order);
    }

    fn limit(&mut self, limit: usize) {
        self.limit = Some(limit);
    }

    fn offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn builds_filters_and_orders() {
        let mut q = CloudQuery::new("Device", false);
        q.filter("Enabled =", Value::Bool(true)).unwrap();
        q.filter("Name =", Value::Null).unwrap();
        q.filter_field("Updated", ">=", Value::Int(5)).unwrap();
        q.order("-Updated");
        q.order("Name");
        q.limit(10);

        assert_eq!(q.filters().len(), 2);
        assert_eq!(q.filters()[1], FieldFilter::new("Updated", Operator::Ge, Value::Int(5)));
        assert_eq!(
            q.orders(),
            &[
                ("Updated".to_string(), Direction::Descending),
                ("Name".to_string(), Direction::Ascending)
            ]
        );
        assert_eq!(q.limit_value(), Some(10));
    }

    #[test]
    fn malformed_filters_fail_immediately() {
        let mut q = CloudQuery::new("Device", true);
        let err = q.filter("Enabled", Value::Bool(true)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));
        let err = q.filter_field("Enabled", "~", Value::Bool(true)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperator(_)));
    }

    #[test]
    fn not_equal_is_not_read_as_equal() {
        let mut q = CloudQuery::new("Device", true);
        let err = q.filter("Weight !=", Value::Int(10)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperator(ref op) if op == "!="));
        let err = q.filter("Weight <>", Value::Int(10)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperator(_)));
        assert!(q.filters().is_empty());
    }
}
