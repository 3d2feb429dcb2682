//! Entity filters used to scope a sync to part of the local store.

use super::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean filter over entity fields.
///
/// A missing field compares equal to `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    /// Field is present and not `null`
    Exists { field: String },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Predicate::Exists {
            field: field.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And { mut all } => {
                all.push(other);
                Predicate::And { all }
            }
            first => Predicate::And {
                all: vec![first, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    /// Evaluate the predicate against an entity
    pub fn matches<E: Entity + ?Sized>(&self, entity: &E) -> bool {
        match self {
            Predicate::Eq { field, value } => field_or_null(entity, field) == value,
            Predicate::Ne { field, value } => field_or_null(entity, field) != value,
            Predicate::In { field, values } => values.contains(field_or_null(entity, field)),
            Predicate::Exists { field } => !field_or_null(entity, field).is_null(),
            Predicate::And { all } => all.iter().all(|p| p.matches(entity)),
            Predicate::Or { any } => any.iter().any(|p| p.matches(entity)),
            Predicate::Not { predicate } => !predicate.matches(entity),
        }
    }
}

fn field_or_null<'a, E: Entity + ?Sized>(entity: &'a E, field: &str) -> &'a Value {
    entity.get(field).unwrap_or(&Value::Null)
}
