use serde_json::Value;
use std::cmp::Ordering;

use super::{ Document, DocumentSnapshot, Snapshot };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Equals {
        field: String,
        value: Value,
    },
    /// The field is an array holding `value`.
    ArrayContains {
        field: String,
        value: Value,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: path.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equals { field: field.into(), value: value.into() });
        self
    }

    pub fn array_contains(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::ArrayContains { field: field.into(), value: value.into() });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy { field: field.into(), direction });
        self
    }

    pub fn matches(&self, data: &Document) -> bool {
        self.filters.iter().all(|filter| match filter {
            Filter::Equals { field, value } => lookup(data, field) == Some(value),
            Filter::ArrayContains { field, value } =>
                lookup(data, field)
                    .and_then(Value::as_array)
                    .map(|items| items.contains(value))
                    .unwrap_or(false),
        })
    }

    /// Filters and orders `documents` (all members of `self.collection`).
    /// Documents without the order field are left out; ties fall back to the
    /// document key so repeated evaluations agree.
    pub fn evaluate(&self, documents: impl IntoIterator<Item = DocumentSnapshot>) -> Snapshot {
        let mut result: Snapshot = documents
            .into_iter()
            .filter(|doc| self.matches(&doc.data))
            .filter(|doc| match &self.order_by {
                Some(order) => lookup(&doc.data, &order.field).is_some(),
                None => true,
            })
            .collect();

        match &self.order_by {
            Some(order) => {
                result.sort_by(|a, b| {
                    let ordering = compare_values(
                        lookup(&a.data, &order.field),
                        lookup(&b.data, &order.field)
                    );
                    let ordering = match order.direction {
                        Direction::Ascending => ordering,
                        Direction::Descending => ordering.reverse(),
                    };
                    ordering.then_with(|| a.id.cmp(&b.id))
                });
            }
            None => result.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        result
    }
}

/// Resolves a dotted field path such as `unreadCounts.u1`.
pub fn lookup<'a>(data: &'a Document, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) =>
            match (a, b) {
                (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
                (Value::Number(x), Value::Number(y)) =>
                    match (x.as_i64(), y.as_i64()) {
                        (Some(x), Some(y)) => x.cmp(&y),
                        _ => {
                            let x = x.as_f64().unwrap_or(0.0);
                            let y = y.as_f64().unwrap_or(0.0);
                            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                        }
                    }
                (Value::String(x), Value::String(y)) => x.cmp(y),
                _ => type_rank(a).cmp(&type_rank(b)),
            }
    }
}
