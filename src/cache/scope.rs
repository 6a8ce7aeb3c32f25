//! Local predicates and sort descriptors evaluated over stored documents.

use std::cmp::Ordering;

use serde_json::Value;

use super::traits::{document_id, ID_FIELD};

/// Filter over the top-level fields of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
  /// Matches every document
  All,
  /// Field equals the value
  Eq(String, Value),
  /// Field equals one of the values
  In(String, Vec<Value>),
  /// Field is present and not null
  Exists(String),
  And(Vec<Predicate>),
  Or(Vec<Predicate>),
  Not(Box<Predicate>),
}

impl Predicate {
  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Predicate::Eq(field.into(), value.into())
  }

  pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
    Predicate::In(field.into(), values.into_iter().map(Into::into).collect())
  }

  pub fn and(self, other: Predicate) -> Self {
    match self {
      Predicate::All => other,
      Predicate::And(mut parts) => {
        parts.push(other);
        Predicate::And(parts)
      }
      this => Predicate::And(vec![this, other]),
    }
  }

  pub fn negate(self) -> Self {
    Predicate::Not(Box::new(self))
  }

  pub fn matches(&self, doc: &Value) -> bool {
    match self {
      Predicate::All => true,
      Predicate::Eq(field, value) => doc.get(field).is_some_and(|v| values_equal(v, value)),
      Predicate::In(field, values) => doc
        .get(field)
        .is_some_and(|v| values.iter().any(|candidate| values_equal(v, candidate))),
      Predicate::Exists(field) => doc.get(field).is_some_and(|v| !v.is_null()),
      Predicate::And(parts) => parts.iter().all(|p| p.matches(doc)),
      Predicate::Or(parts) => parts.iter().any(|p| p.matches(doc)),
      Predicate::Not(inner) => !inner.matches(doc),
    }
  }
}

/// Numbers compare by value so that `1` and `1.0` are the same key.
fn values_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    _ => a == b,
  }
}

/// One sort key. Missing fields sort as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
  pub key: String,
  pub ascending: bool,
}

impl SortDescriptor {
  pub fn ascending(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      ascending: true,
    }
  }

  pub fn descending(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      ascending: false,
    }
  }
}

/// Which rows a use case shows and in what order.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
  pub predicate: Predicate,
  pub order: Vec<SortDescriptor>,
  /// Field used to group rows into sections, if any
  pub section_key: Option<String>,
}

impl Scope {
  /// Every row of the entity type, ordered by `order_by` ascending.
  pub fn all(order_by: impl Into<String>) -> Self {
    Self {
      predicate: Predicate::All,
      order: vec![SortDescriptor::ascending(order_by)],
      section_key: None,
    }
  }

  /// Rows whose `field` equals `value`, ordered by `order_by` ascending.
  pub fn where_eq(field: impl Into<String>, value: impl Into<Value>, order_by: impl Into<String>) -> Self {
    Self {
      predicate: Predicate::eq(field, value),
      order: vec![SortDescriptor::ascending(order_by)],
      section_key: None,
    }
  }

  pub fn with_order(mut self, order: Vec<SortDescriptor>) -> Self {
    self.order = order;
    self
  }

  pub fn sectioned_by(mut self, key: impl Into<String>) -> Self {
    self.section_key = Some(key.into());
    self
  }
}

impl Default for Scope {
  fn default() -> Self {
    Scope::all(ID_FIELD)
  }
}

fn type_rank(v: &Value) -> u8 {
  match v {
    Value::Null => 0,
    Value::Bool(_) => 1,
    Value::Number(_) => 2,
    Value::String(_) => 3,
    Value::Array(_) => 4,
    Value::Object(_) => 5,
  }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    (Value::Number(x), Value::Number(y)) => {
      let x = x.as_f64().unwrap_or(0.0);
      let y = y.as_f64().unwrap_or(0.0);
      x.total_cmp(&y)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
      a.to_string().cmp(&b.to_string())
    }
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

/// Compare two documents by the sort descriptors, breaking ties by id ascending.
pub fn compare_documents(a: &Value, b: &Value, order: &[SortDescriptor]) -> Ordering {
  for descriptor in order {
    let left = a.get(&descriptor.key).unwrap_or(&Value::Null);
    let right = b.get(&descriptor.key).unwrap_or(&Value::Null);
    let ordering = compare_values(left, right);
    let ordering = if descriptor.ascending {
      ordering
    } else {
      ordering.reverse()
    };
    if ordering != Ordering::Equal {
      return ordering;
    }
  }
  document_id(a).cmp(&document_id(b))
}

/// Filter and order documents for a query.
pub fn select(docs: impl IntoIterator<Item = Value>, predicate: &Predicate, order: &[SortDescriptor]) -> Vec<Value> {
  let mut selected: Vec<Value> = docs.into_iter().filter(|d| predicate.matches(d)).collect();
  selected.sort_by(|a, b| compare_documents(a, b, order));
  selected
}
