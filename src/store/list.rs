//! List semantics shared by every read-modify-write backend.
//!
//! The LRU, layered, and embedded backends (and the in-process connectors)
//! all load a list, mutate a local copy with these functions, and install
//! the result. Keeping the rules here is what makes the backends agree on
//! ordering, equality, and error outcomes.

use crate::error::{Error, Result};
use crate::value::{Body, Kind, Value};

/// Which end of a list `Pop` removes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopFrom {
    /// `pos = 1`
    Tail,
    /// `pos = -1`
    Head,
}

impl PopFrom {
    /// Maps a MongoDB-style `$pop` position onto an end of the list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for anything other than `1` or `-1`.
    pub fn from_position(position: i64) -> Result<Self> {
        match position {
            1 => Ok(Self::Tail),
            -1 => Ok(Self::Head),
            other => Err(Error::invalid_argument(format!(
                "pop position must be 1 or -1, got {other}"
            ))),
        }
    }
}

/// Borrows the list held by `body`, treating an absent key as empty.
///
/// # Errors
///
/// Returns `InvalidKind` when the key holds a scalar.
pub fn as_list<'a>(key: &str, body: Option<&'a Body>) -> Result<&'a [Value]> {
    match body {
        None => Ok(&[]),
        Some(Body::List(items)) => Ok(items),
        Some(Body::Scalar(_)) => Err(Error::invalid_kind(key, Kind::List)),
    }
}

/// Takes ownership of the list held by `body`, creating an empty one for an
/// absent key.
///
/// # Errors
///
/// Returns `InvalidKind` when the key holds a scalar.
pub fn into_list(key: &str, body: Option<Body>) -> Result<Vec<Value>> {
    match body {
        None => Ok(Vec::new()),
        Some(Body::List(items)) => Ok(items),
        Some(Body::Scalar(_)) => Err(Error::invalid_kind(key, Kind::List)),
    }
}

/// Applies `delta` to the counter held by `body` (absent reads as zero).
///
/// # Errors
///
/// Returns `InvalidKind` for lists and non-integer scalars and `Overflow`
/// when the result leaves the `i64` range.
pub fn apply_delta(key: &str, body: Option<&Body>, delta: i64) -> Result<i64> {
    let current = match body {
        None => 0,
        Some(Body::Scalar(v)) => v.as_counter().ok_or_else(|| Error::not_integer(key))?,
        Some(Body::List(_)) => return Err(Error::invalid_kind(key, Kind::Value)),
    };
    current.checked_add(delta).ok_or_else(|| Error::overflow(key))
}

/// Negates a `Decr` delta so it can be applied as an increment.
///
/// # Errors
///
/// Returns `Overflow` for `i64::MIN`, which has no positive counterpart.
pub fn negate_delta(key: &str, delta: i64) -> Result<i64> {
    delta.checked_neg().ok_or_else(|| Error::overflow(key))
}

/// Appends `values` in argument order. Returns the new length.
pub fn push(list: &mut Vec<Value>, values: Vec<Value>) -> usize {
    list.extend(values);
    list.len()
}

/// Removes and returns one end of the list.
///
/// # Errors
///
/// Returns `NotFound` when the list is empty.
pub fn pop(key: &str, list: &mut Vec<Value>, from: PopFrom) -> Result<Value> {
    if list.is_empty() {
        return Err(Error::not_found(key));
    }
    Ok(match from {
        PopFrom::Tail => list.remove(list.len() - 1),
        PopFrom::Head => list.remove(0),
    })
}

/// Removes every element equal to `value`. Returns how many were removed.
pub fn pull(list: &mut Vec<Value>, value: &Value) -> usize {
    let before = list.len();
    list.retain(|item| item != value);
    before - list.len()
}

/// Removes every element equal to any of `values`.
pub fn pull_all(list: &mut Vec<Value>, values: &[Value]) -> usize {
    let before = list.len();
    list.retain(|item| !values.contains(item));
    before - list.len()
}

/// Appends each value not already present, deduplicating the input too.
/// Returns how many values were appended.
pub fn add_to_set(list: &mut Vec<Value>, values: Vec<Value>) -> usize {
    let mut added = 0;
    for value in values {
        if !list.contains(&value) {
            list.push(value);
            added += 1;
        }
    }
    added
}

/// Returns the element at a 0-based index.
///
/// # Errors
///
/// Returns `OutOfRange` when `index >= len`.
pub fn get(key: &str, list: &[Value], index: usize) -> Result<Value> {
    list.get(index)
        .cloned()
        .ok_or_else(|| Error::out_of_range(key, index, list.len()))
}

/// Replaces the element at a 0-based index without extending the list.
///
/// # Errors
///
/// Returns `OutOfRange` when `index >= len`.
pub fn set(key: &str, list: &mut [Value], index: usize, value: Value) -> Result<()> {
    let len = list.len();
    let slot = list
        .get_mut(index)
        .ok_or_else(|| Error::out_of_range(key, index, len))?;
    *slot = value;
    Ok(())
}

/// Returns `[skip, skip + limit)` clipped to the list.
pub fn slice(list: &[Value], skip: usize, limit: usize) -> Vec<Value> {
    list.iter().skip(skip).take(limit).cloned().collect()
}

/// Translates a 1-based page into `(skip, limit)`.
///
/// # Errors
///
/// Returns `InvalidArgument` for `page < 1`.
pub fn page_bounds(page: usize, page_size: usize) -> Result<(usize, usize)> {
    if page < 1 {
        return Err(Error::invalid_argument("page must be >= 1"));
    }
    Ok(((page - 1).saturating_mul(page_size), page_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strings(items: &[&str]) -> Vec<Value> {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn test_pop_positions() {
        let mut list = strings(&["a", "b", "c"]);
        assert_eq!(pop("L", &mut list, PopFrom::Tail).unwrap(), Value::from("c"));
        assert_eq!(pop("L", &mut list, PopFrom::Head).unwrap(), Value::from("a"));
        assert_eq!(list, strings(&["b"]));

        assert!(matches!(PopFrom::from_position(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(PopFrom::from_position(2), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_pop_empty_is_not_found() {
        let mut list = Vec::new();
        assert!(matches!(
            pop("L", &mut list, PopFrom::Tail),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_pull_removes_every_match() {
        let mut list = strings(&["red", "blue", "red", "green", "red"]);
        assert_eq!(pull(&mut list, &Value::from("red")), 3);
        assert_eq!(list, strings(&["blue", "green"]));
        assert_eq!(pull(&mut list, &Value::from("red")), 0);

        assert_eq!(pull_all(&mut list, &strings(&["blue", "green"])), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_add_to_set_dedupes_input() {
        let mut list = Vec::new();
        let added = add_to_set(&mut list, strings(&["x", "y", "z", "x", "y"]));
        assert_eq!(added, 3);
        assert_eq!(list, strings(&["x", "y", "z"]));
    }

    #[test]
    fn test_set_does_not_extend() {
        let mut list = strings(&["a", "b"]);
        assert!(matches!(
            set("L", &mut list, 2, Value::from("c")),
            Err(Error::OutOfRange { index: 2, len: 2, .. })
        ));
        set("L", &mut list, 1, Value::from("B")).unwrap();
        assert_eq!(list, strings(&["a", "B"]));
    }

    #[test]
    fn test_pagination() {
        let list = strings(&["a", "b", "c", "d", "e", "f"]);
        assert_eq!(slice(&list, 1, 3), strings(&["b", "c", "d"]));
        let (skip, limit) = page_bounds(2, 2).unwrap();
        assert_eq!(slice(&list, skip, limit), strings(&["c", "d"]));
        let (skip, limit) = page_bounds(10, 2).unwrap();
        assert!(slice(&list, skip, limit).is_empty());
        assert!(page_bounds(0, 2).is_err());
        assert!(slice(&list, 6, 1).is_empty());
    }

    #[test]
    fn test_scalar_is_wrong_kind_for_lists() {
        let body = Body::Scalar(Value::Int(1));
        assert!(matches!(as_list("k", Some(&body)), Err(Error::InvalidKind { .. })));
        assert!(matches!(
            into_list("k", Some(body)),
            Err(Error::InvalidKind { .. })
        ));
    }

    #[test]
    fn test_apply_delta() {
        assert_eq!(apply_delta("n", None, 5).unwrap(), 5);
        let body = Body::Scalar(Value::Int(i64::MAX));
        assert!(matches!(apply_delta("n", Some(&body), 1), Err(Error::Overflow { .. })));
        let list = Body::List(vec![]);
        assert!(matches!(apply_delta("n", Some(&list), 1), Err(Error::InvalidKind { .. })));
        let text = Body::Scalar(Value::from("abc"));
        assert!(matches!(apply_delta("n", Some(&text), 1), Err(Error::InvalidKind { .. })));
        assert!(matches!(negate_delta("n", i64::MIN), Err(Error::Overflow { .. })));
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            (0i64..8).prop_map(Value::Int),
            "[a-d]".prop_map(Value::String),
            any::<bool>().prop_map(Value::Bool),
        ]
    }

    proptest! {
        #[test]
        fn prop_index_slice_page_agree(items in prop::collection::vec(value_strategy(), 1..30)) {
            for i in 0..items.len() {
                let by_index = get("L", &items, i).unwrap();
                let by_slice = slice(&items, i, 1);
                let (skip, limit) = page_bounds(i + 1, 1).unwrap();
                let by_page = slice(&items, skip, limit);
                prop_assert_eq!(&by_index, &by_slice[0]);
                prop_assert_eq!(&by_index, &items[i]);
                prop_assert_eq!(&by_index, &by_page[0]);
            }
        }

        #[test]
        fn prop_pull_is_idempotent(
            items in prop::collection::vec(value_strategy(), 0..30),
            target in value_strategy(),
        ) {
            let mut list = items;
            pull(&mut list, &target);
            prop_assert!(!list.contains(&target));
            let snapshot = list.clone();
            prop_assert_eq!(pull(&mut list, &target), 0);
            prop_assert_eq!(list, snapshot);
        }

        #[test]
        fn prop_add_to_set_keeps_first_occurrence_order(
            batches in prop::collection::vec(prop::collection::vec(value_strategy(), 0..8), 0..6),
        ) {
            let mut list = Vec::new();
            let mut expected: Vec<Value> = Vec::new();
            for batch in batches {
                for v in &batch {
                    if !expected.contains(v) {
                        expected.push(v.clone());
                    }
                }
                add_to_set(&mut list, batch);
            }
            prop_assert_eq!(list, expected);
        }
    }
}
