//! Flattening of nested name-keyed mappings for transport through interfaces
//! that only accept flat `name -> value` inputs.
//!
//! Keys are joined with `/`. Literal `/` and `\` inside a key are escaped, so
//! `unflatten(flatten(x), prefixes)` rebuilds `x` exactly for any nesting depth.

use crate::error::{IterationError, IterationResult};
use std::collections::BTreeMap;

pub const DELIMITER: char = '/';
const ESCAPE: char = '\\';

/// A leaf value or a further level of named entries.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested<T> {
    Leaf(T),
    Map(NestedMap<T>),
}

pub type NestedMap<T> = BTreeMap<String, Nested<T>>;

fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        if ch == DELIMITER || ch == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(ch);
    }
    out
}

fn split(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = key.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => current.extend(chars.next()),
            DELIMITER => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}

/// Flattens `nested` into `"outer/inner/leaf" -> value` entries.
#[must_use]
pub fn flatten<T: Clone>(nested: &NestedMap<T>) -> BTreeMap<String, T> {
    let mut flat = BTreeMap::new();
    flatten_into(nested, "", &mut flat);
    flat
}

fn flatten_into<T: Clone>(nested: &NestedMap<T>, prefix: &str, flat: &mut BTreeMap<String, T>) {
    for (key, value) in nested {
        let full = format!("{prefix}{}", escape(key));
        match value {
            Nested::Leaf(leaf) => {
                flat.insert(full, leaf.clone());
            }
            Nested::Map(inner) => flatten_into(inner, &format!("{full}{DELIMITER}"), flat),
        }
    }
}

/// Rebuilds the nesting under each of `prefixes`.
///
/// Keys that do not start with one of `prefixes` are kept as top-level leaves
/// under their unescaped flat key.
pub fn unflatten<T, S: AsRef<str>>(flat: BTreeMap<String, T>, prefixes: &[S]) -> IterationResult<NestedMap<T>> {
    let mut nested = NestedMap::new();
    for (key, value) in flat {
        let segments = split(&key);
        let prefixed = segments.len() > 1 && prefixes.iter().any(|p| p.as_ref() == segments[0]);
        if prefixed {
            insert_path(&mut nested, &segments, value, &key)?;
        } else {
            nested.insert(segments.join(&DELIMITER.to_string()), Nested::Leaf(value));
        }
    }
    Ok(nested)
}

fn insert_path<T>(nested: &mut NestedMap<T>, path: &[String], value: T, key: &str) -> IterationResult<()> {
    let (last, parents) = path.split_last().ok_or_else(|| {
        IterationError::Evaluation(format!("cannot unflatten empty key '{key}'"))
    })?;
    let mut level = nested;
    for segment in parents {
        let entry = level.entry(segment.clone()).or_insert_with(|| Nested::Map(NestedMap::new()));
        level = match entry {
            Nested::Map(inner) => inner,
            Nested::Leaf(_) => {
                return Err(IterationError::Evaluation(format!(
                    "flat key '{key}' nests under leaf '{segment}'"
                )))
            }
        };
    }
    if level.insert(last.clone(), Nested::Leaf(value)).is_some() {
        return Err(IterationError::Evaluation(format!("flat key '{key}' is duplicated")));
    }
    Ok(())
}
