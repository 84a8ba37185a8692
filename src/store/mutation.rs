//! Read-modify-write steps for counters and list operations.
//!
//! Backends without native list structures (LRU, layered, embedded, and the
//! in-process connectors) read the current body, apply a [`Mutation`] to a
//! local copy, and install the result under their own per-key exclusion.

use super::list::{self, PopFrom};
use crate::error::{Error, Result};
use crate::value::{Body, Value};

#[derive(Debug, Clone)]
pub enum Mutation {
    Incr(i64),
    Push(Vec<Value>),
    Pop(PopFrom),
    Pull(Value),
    PullAll(Vec<Value>),
    AddToSet(Vec<Value>),
    ArraySet(usize, Value),
}

/// What a mutation reports back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Int(i64),
    Count(usize),
    Value(Value),
    Unit,
}

/// Result of applying a mutation to the current body.
#[derive(Debug)]
pub struct Applied {
    /// New body to install, `None` when nothing changed.
    pub body: Option<Body>,
    pub outcome: Outcome,
}

impl Applied {
    fn changed(body: Body, outcome: Outcome) -> Self {
        Self {
            body: Some(body),
            outcome,
        }
    }

    fn unchanged(outcome: Outcome) -> Self {
        Self {
            body: None,
            outcome,
        }
    }
}

impl Mutation {
    /// Applies the mutation to `current`, which is `None` for an absent key.
    ///
    /// On error nothing must be installed.
    ///
    /// # Errors
    ///
    /// Returns the contract error for the operation (`InvalidKind`,
    /// `NotFound`, `OutOfRange`, `Overflow`).
    pub fn apply(self, key: &str, current: Option<&Body>) -> Result<Applied> {
        match self {
            Self::Incr(delta) => {
                let next = list::apply_delta(key, current, delta)?;
                Ok(Applied::changed(Body::Scalar(Value::Int(next)), Outcome::Int(next)))
            },
            Self::Push(values) => {
                let mut items = list::as_list(key, current)?.to_vec();
                let len = list::push(&mut items, values);
                Ok(Applied::changed(Body::List(items), Outcome::Count(len)))
            },
            Self::Pop(from) => {
                let mut items = list::as_list(key, current)?.to_vec();
                let value = list::pop(key, &mut items, from)?;
                Ok(Applied::changed(Body::List(items), Outcome::Value(value)))
            },
            Self::Pull(value) => {
                let items = list::as_list(key, current)?;
                if !items.contains(&value) {
                    return Ok(Applied::unchanged(Outcome::Count(0)));
                }
                let mut items = items.to_vec();
                let removed = list::pull(&mut items, &value);
                Ok(Applied::changed(Body::List(items), Outcome::Count(removed)))
            },
            Self::PullAll(values) => {
                let items = list::as_list(key, current)?;
                if !items.iter().any(|item| values.contains(item)) {
                    return Ok(Applied::unchanged(Outcome::Count(0)));
                }
                let mut items = items.to_vec();
                let removed = list::pull_all(&mut items, &values);
                Ok(Applied::changed(Body::List(items), Outcome::Count(removed)))
            },
            Self::AddToSet(values) => {
                let mut items = list::as_list(key, current)?.to_vec();
                let added = list::add_to_set(&mut items, values);
                if added == 0 && current.is_some() {
                    return Ok(Applied::unchanged(Outcome::Count(0)));
                }
                Ok(Applied::changed(Body::List(items), Outcome::Count(added)))
            },
            Self::ArraySet(index, value) => {
                let mut items = list::as_list(key, current)?.to_vec();
                list::set(key, &mut items, index, value)?;
                Ok(Applied::changed(Body::List(items), Outcome::Unit))
            },
        }
    }
}

impl Outcome {
    pub fn into_int(self) -> Result<i64> {
        match self {
            Self::Int(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_count(self) -> Result<usize> {
        match self {
            Self::Count(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(outcome: &Outcome) -> Error {
    Error::backend(anyhow::anyhow!("unexpected mutation outcome {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_creates_list_on_absent_key() {
        let applied = Mutation::Push(vec![Value::from("a")]).apply("L", None).unwrap();
        assert_eq!(applied.body, Some(Body::List(vec![Value::from("a")])));
        assert_eq!(applied.outcome, Outcome::Count(1));
    }

    #[test]
    fn test_pull_on_absent_key_writes_nothing() {
        let applied = Mutation::Pull(Value::from("x")).apply("L", None).unwrap();
        assert!(applied.body.is_none());
        assert_eq!(applied.outcome, Outcome::Count(0));
    }

    #[test]
    fn test_pop_absent_key_is_not_found() {
        assert!(matches!(
            Mutation::Pop(PopFrom::Tail).apply("L", None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_ops_reject_scalars() {
        let scalar = Body::from("x");
        for m in [
            Mutation::Push(vec![]),
            Mutation::Pop(PopFrom::Head),
            Mutation::Pull(Value::Null),
            Mutation::AddToSet(vec![]),
            Mutation::ArraySet(0, Value::Null),
        ] {
            assert!(matches!(m.apply("k", Some(&scalar)), Err(Error::InvalidKind { .. })));
        }
    }

    #[test]
    fn test_incr_on_list_is_invalid_kind() {
        let list = Body::List(vec![]);
        assert!(matches!(
            Mutation::Incr(1).apply("n", Some(&list)),
            Err(Error::InvalidKind { .. })
        ));
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(Outcome::Int(3).into_int().unwrap(), 3);
        assert!(Outcome::Unit.into_count().is_err());
    }
}
