//! Fuzz target for list semantics.
//!
//! Applies arbitrary sequences of list operations and checks the result
//! against a plain `Vec` model after every step.
//!
//! Run with: `cargo +nightly fuzz run fuzz_list_ops`

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use unistore::Value;
use unistore::store::PopFrom;
use unistore::store::list;

#[derive(Arbitrary, Debug)]
enum Op {
    Push(Vec<u8>),
    Pop(bool),
    Pull(u8),
    PullAll(Vec<u8>),
    AddToSet(Vec<u8>),
    Set(u8, u8),
    Slice(u8, u8),
    Page(u8, u8),
}

fn int(v: u8) -> Value {
    Value::Int(i64::from(v % 8))
}

fuzz_target!(|ops: Vec<Op>| {
    let mut list: Vec<Value> = Vec::new();
    let mut model: Vec<Value> = Vec::new();

    for op in ops {
        match op {
            Op::Push(values) => {
                let values: Vec<Value> = values.into_iter().map(int).collect();
                model.extend(values.iter().cloned());
                assert_eq!(list::push(&mut list, values), model.len());
            },
            Op::Pop(tail) => {
                let from = if tail { PopFrom::Tail } else { PopFrom::Head };
                let expected = if model.is_empty() {
                    None
                } else if tail {
                    model.pop()
                } else {
                    Some(model.remove(0))
                };
                assert_eq!(list::pop("L", &mut list, from).ok(), expected);
            },
            Op::Pull(v) => {
                let v = int(v);
                let before = model.len();
                model.retain(|item| *item != v);
                assert_eq!(list::pull(&mut list, &v), before - model.len());
                assert!(!list.contains(&v));
            },
            Op::PullAll(values) => {
                let values: Vec<Value> = values.into_iter().map(int).collect();
                model.retain(|item| !values.contains(item));
                list::pull_all(&mut list, &values);
            },
            Op::AddToSet(values) => {
                for v in values.iter().copied().map(int) {
                    if !model.contains(&v) {
                        model.push(v);
                    }
                }
                list::add_to_set(&mut list, values.into_iter().map(int).collect());
            },
            Op::Set(index, v) => {
                let index = usize::from(index);
                let result = list::set("L", &mut list, index, int(v));
                if index < model.len() {
                    assert!(result.is_ok());
                    model[index] = int(v);
                } else {
                    assert!(result.is_err());
                }
            },
            Op::Slice(skip, limit) => {
                let (skip, limit) = (usize::from(skip), usize::from(limit));
                let expected: Vec<Value> = model.iter().skip(skip).take(limit).cloned().collect();
                assert_eq!(list::slice(&list, skip, limit), expected);
            },
            Op::Page(page, size) => {
                let (page, size) = (usize::from(page), usize::from(size));
                match list::page_bounds(page, size) {
                    Ok((skip, limit)) => {
                        assert!(page >= 1);
                        let expected: Vec<Value> =
                            model.iter().skip(skip).take(limit).cloned().collect();
                        assert_eq!(list::slice(&list, skip, limit), expected);
                    },
                    Err(_) => assert_eq!(page, 0),
                }
            },
        }
        assert_eq!(list, model);
    }
});
