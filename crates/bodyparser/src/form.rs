//! Structured collection of form fields keyed by bracketed or dotted paths.
//!
//! Keys are parsed into a path of [`Segment`]s and values are merged into a
//! [`FormNode`] tree:
//!
//! - `user[email]=a` and `user.email=a` build nested objects
//! - `name[]=a`, `name[]=b` append to an array in arrival order
//! - `user[1]=x`, `user[0]=y` assign by index, holes are filled with [`FormNode::Null`]
//! - writing a key that already holds a value promotes it into a two element array
//! - writing below a key that holds a value (`user=a`, then `user[email]=b`)
//!   promotes it too, the second element holds the rest of the path. A leading
//!   index is dropped there, so `name=a`, `name[0]=b` gives `["a", "b"]`
//!
//! The same tree is used for plain fields (`FormFields<String>`) and for uploaded
//! files (`FormFields<FileHandle>`).

use std::collections::BTreeMap;
use std::mem;

use serde::Serialize;

/// Indices above this are treated as object keys, so a single field cannot
/// allocate an arbitrarily large array.
const MAX_ARRAY_INDEX: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FormNode<T> {
    Null,
    Value(T),
    Array(Vec<FormNode<T>>),
    Object(BTreeMap<String, FormNode<T>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Key(String),
    Index(usize),
}

/// Ordered-insensitive mapping from key paths to values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FormFields<T> {
    root: BTreeMap<String, FormNode<T>>,
}

impl<T> Default for FormFields<T> {
    fn default() -> Self {
        Self { root: BTreeMap::new() }
    }
}

impl<T> FormNode<T> {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, FormNode::Null)
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            FormNode::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FormNode<T>]> {
        match self {
            FormNode::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, FormNode<T>>> {
        match self {
            FormNode::Object(map) => Some(map),
            _ => None,
        }
    }

    /// The value itself, or the first value of an array.
    pub fn first_value(&self) -> Option<&T> {
        match self {
            FormNode::Value(value) => Some(value),
            FormNode::Array(items) => items.iter().find_map(FormNode::first_value),
            _ => None,
        }
    }

    /// All leaf values below this node, depth first.
    pub fn values(&self) -> Vec<&T> {
        let mut values = vec![];
        self.collect_values(&mut values);
        values
    }

    fn collect_values<'a>(&'a self, values: &mut Vec<&'a T>) {
        match self {
            FormNode::Null => {}
            FormNode::Value(value) => values.push(value),
            FormNode::Array(items) => items.iter().for_each(|item| item.collect_values(values)),
            FormNode::Object(map) => map.values().for_each(|item| item.collect_values(values)),
        }
    }
}

impl<T> FormFields<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn root(&self) -> &BTreeMap<String, FormNode<T>> {
        &self.root
    }

    pub fn into_root(self) -> BTreeMap<String, FormNode<T>> {
        self.root
    }

    /// Adds `value` under `key`, following the merge rules of this module.
    pub fn add(&mut self, key: &str, value: T) {
        self.add_node(key, FormNode::Value(value));
    }

    /// Adds an explicit null under `key`.
    pub fn add_null(&mut self, key: &str) {
        self.add_node(key, FormNode::Null);
    }

    fn add_node(&mut self, key: &str, node: FormNode<T>) {
        let (segments, append) = parse_key(key);
        if segments.is_empty() {
            return;
        }

        if let Some(len) = self.value_prefix_len(&segments)
            && let Some(existing) = self.get_mut(&segments[..len])
        {
            let rest = match &segments[len..] {
                [Segment::Index(_), rest @ ..] => rest,
                rest => rest,
            };
            let mut subtree = FormNode::Null;
            assign(&mut subtree, rest, if append { FormNode::Array(vec![node]) } else { node });
            let previous = mem::replace(existing, FormNode::Null);
            *existing = FormNode::Array(vec![previous, subtree]);
            return;
        }

        match self.get_mut(&segments) {
            Some(FormNode::Array(items)) => items.push(node),
            Some(existing @ (FormNode::Value(_) | FormNode::Object(_))) => {
                let previous = mem::replace(existing, FormNode::Null);
                *existing = FormNode::Array(vec![previous, node]);
            }
            Some(FormNode::Null) | None => {
                let node = if append { FormNode::Array(vec![node]) } else { node };
                self.set(&segments, node);
            }
        }
    }

    /// Looks a key path up, `user[email]` and `user.email` are equivalent.
    pub fn get(&self, key: &str) -> Option<&FormNode<T>> {
        let (segments, _) = parse_key(key);
        let (first, rest) = segments.split_first()?;
        let mut node = self.root.get(&root_key(first))?;
        for segment in rest {
            node = match (segment, node) {
                (Segment::Index(index), FormNode::Array(items)) => items.get(*index)?,
                (Segment::Index(index), FormNode::Object(map)) => map.get(&index.to_string())?,
                (Segment::Key(key), FormNode::Object(map)) => map.get(key)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// All leaf values of the collection.
    pub fn values(&self) -> Vec<&T> {
        let mut values = vec![];
        self.root.values().for_each(|node| node.collect_values(&mut values));
        values
    }

    /// Length of the strict prefix of `segments` that ends at an existing value.
    fn value_prefix_len(&self, segments: &[Segment]) -> Option<usize> {
        let (first, rest) = segments.split_first()?;
        let mut node = self.root.get(&root_key(first))?;
        for (depth, segment) in rest.iter().enumerate() {
            node = match (segment, node) {
                (_, FormNode::Value(_)) => return Some(depth + 1),
                (Segment::Index(index), FormNode::Array(items)) => items.get(*index)?,
                (Segment::Index(index), FormNode::Object(map)) => map.get(&index.to_string())?,
                (Segment::Key(key), FormNode::Object(map)) => map.get(key)?,
                _ => return None,
            };
        }
        None
    }

    fn get_mut(&mut self, segments: &[Segment]) -> Option<&mut FormNode<T>> {
        let (first, rest) = segments.split_first()?;
        let mut node = self.root.get_mut(&root_key(first))?;
        for segment in rest {
            node = match (segment, node) {
                (Segment::Index(index), FormNode::Array(items)) => items.get_mut(*index)?,
                (Segment::Index(index), FormNode::Object(map)) => map.get_mut(&index.to_string())?,
                (Segment::Key(key), FormNode::Object(map)) => map.get_mut(key)?,
                _ => return None,
            };
        }
        Some(node)
    }

    fn set(&mut self, segments: &[Segment], node: FormNode<T>) {
        let Some((first, rest)) = segments.split_first() else {
            return;
        };
        let slot = self.root.entry(root_key(first)).or_insert(FormNode::Null);
        assign(slot, rest, node);
    }
}

impl FormFields<String> {
    /// Adds a plain text field, turning empty strings into nulls when asked to.
    pub fn add_text(&mut self, key: &str, value: String, convert_empty_strings_to_null: bool) {
        if convert_empty_strings_to_null && value.is_empty() {
            self.add_null(key);
        } else {
            self.add(key, value);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.root.iter().map(|(key, node)| (key.clone(), node_to_json(node))).collect())
    }
}

fn node_to_json(node: &FormNode<String>) -> serde_json::Value {
    match node {
        FormNode::Null => serde_json::Value::Null,
        FormNode::Value(value) => serde_json::Value::String(value.clone()),
        FormNode::Array(items) => serde_json::Value::Array(items.iter().map(node_to_json).collect()),
        FormNode::Object(map) => {
            serde_json::Value::Object(map.iter().map(|(key, node)| (key.clone(), node_to_json(node))).collect())
        }
    }
}

fn root_key(segment: &Segment) -> String {
    match segment {
        Segment::Key(key) => key.clone(),
        Segment::Index(index) => index.to_string(),
    }
}

fn assign<T>(slot: &mut FormNode<T>, segments: &[Segment], node: FormNode<T>) {
    let Some((segment, rest)) = segments.split_first() else {
        *slot = node;
        return;
    };

    match segment {
        Segment::Index(index) => {
            if !matches!(slot, FormNode::Array(_) | FormNode::Object(_)) {
                *slot = FormNode::Array(vec![]);
            }
            if let FormNode::Array(items) = slot {
                if items.len() <= *index {
                    items.resize_with(index + 1, || FormNode::Null);
                }
                assign(&mut items[*index], rest, node);
            } else if let FormNode::Object(map) = slot {
                assign(map.entry(index.to_string()).or_insert(FormNode::Null), rest, node);
            }
        }
        Segment::Key(key) => {
            match slot {
                FormNode::Object(_) => {}
                FormNode::Array(items) => {
                    // a named key on an array turns it into an object keyed by position
                    let map = mem::take(items)
                        .into_iter()
                        .enumerate()
                        .filter(|(_, item)| !item.is_null())
                        .map(|(index, item)| (index.to_string(), item))
                        .collect();
                    *slot = FormNode::Object(map);
                }
                _ => *slot = FormNode::Object(BTreeMap::new()),
            }
            if let FormNode::Object(map) = slot {
                assign(map.entry(key.clone()).or_insert(FormNode::Null), rest, node);
            }
        }
    }
}

/// Splits `user[address][0].street` into segments, returns whether the key
/// ended with `[]`.
pub(crate) fn parse_key(key: &str) -> (Vec<Segment>, bool) {
    let (key, append) = match key.strip_suffix("[]") {
        Some(stripped) => (stripped, true),
        None => (key, false),
    };

    let mut segments = vec![];
    let head_end = key.find(['[', '.']).unwrap_or(key.len());
    if head_end > 0 {
        segments.push(Segment::Key(key[..head_end].to_string()));
    }

    let mut rest = &key[head_end..];
    while !rest.is_empty() {
        if let Some(after_open) = rest.strip_prefix('[') {
            let Some(close) = after_open.find(']') else {
                // unbalanced bracket, keep the remainder verbatim
                segments.push(Segment::Key(rest.to_string()));
                break;
            };
            segments.push(segment_of(&after_open[..close]));
            rest = &after_open[close + 1..];
        } else if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(['[', '.']).unwrap_or(after_dot.len());
            segments.push(Segment::Key(after_dot[..end].to_string()));
            rest = &after_dot[end..];
        } else {
            let end = rest.find(['[', '.']).unwrap_or(rest.len());
            segments.push(Segment::Key(rest[..end].to_string()));
            rest = &rest[end..];
        }
    }

    (segments, append)
}

fn segment_of(inner: &str) -> Segment {
    if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(index) = inner.parse::<usize>() {
            if index <= MAX_ARRAY_INDEX {
                return Segment::Index(index);
            }
        }
    }
    Segment::Key(inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("name"), (vec![Segment::Key("name".into())], false));
        assert_eq!(parse_key("name[]"), (vec![Segment::Key("name".into())], true));
        assert_eq!(
            parse_key("user[address][0].street"),
            (
                vec![
                    Segment::Key("user".into()),
                    Segment::Key("address".into()),
                    Segment::Index(0),
                    Segment::Key("street".into())
                ],
                false
            )
        );
        assert_eq!(parse_key("a[b"), (vec![Segment::Key("a".into()), Segment::Key("[b".into())], false));
    }

    #[test]
    fn test_nested_objects() {
        let mut fields = FormFields::new();
        fields.add("user[email]", "a".to_string());
        fields.add("user[age]", "22".to_string());
        assert_eq!(fields.to_json(), json!({ "user": { "email": "a", "age": "22" } }));
    }

    #[test]
    fn test_append() {
        let mut fields = FormFields::new();
        fields.add("name[]", "a".to_string());
        fields.add("name[]", "b".to_string());
        assert_eq!(fields.to_json(), json!({ "name": ["a", "b"] }));
    }

    #[test]
    fn test_explicit_index_wins_over_arrival_order() {
        let mut fields = FormFields::new();
        fields.add("user[1]", "x".to_string());
        fields.add("user[0]", "y".to_string());
        assert_eq!(fields.to_json(), json!({ "user": ["y", "x"] }));
    }

    #[test]
    fn test_sparse_array_holes_are_null() {
        let mut fields = FormFields::new();
        fields.add("items[2]", "c".to_string());
        assert_eq!(fields.to_json(), json!({ "items": [null, null, "c"] }));
    }

    #[test]
    fn test_scalar_is_promoted_to_array() {
        let mut fields = FormFields::new();
        fields.add("name", "a".to_string());
        fields.add("name[]", "b".to_string());
        fields.add("name", "c".to_string());
        assert_eq!(fields.to_json(), json!({ "name": ["a", "b", "c"] }));
    }

    #[test]
    fn test_value_is_kept_when_nested_key_follows() {
        let mut fields = FormFields::new();
        fields.add("user", "a".to_string());
        fields.add("user[email]", "b".to_string());
        assert_eq!(fields.to_json(), json!({ "user": ["a", { "email": "b" }] }));

        let mut fields = FormFields::new();
        fields.add("name", "a".to_string());
        fields.add("name[0]", "b".to_string());
        assert_eq!(fields.to_json(), json!({ "name": ["a", "b"] }));

        let mut fields = FormFields::new();
        fields.add("profile[name]", "virk".to_string());
        fields.add("profile[name][first]", "v".to_string());
        assert_eq!(fields.to_json(), json!({ "profile": { "name": ["virk", { "first": "v" }] } }));
    }

    #[test]
    fn test_dotted_keys() {
        let mut fields = FormFields::new();
        fields.add("user.profile.name", "virk".to_string());
        assert_eq!(fields.to_json(), json!({ "user": { "profile": { "name": "virk" } } }));
        assert_eq!(fields.get("user[profile][name]").and_then(FormNode::as_value).map(String::as_str), Some("virk"));
    }

    #[test]
    fn test_empty_strings_to_null() {
        let mut fields = FormFields::new();
        fields.add_text("name", String::new(), true);
        fields.add_text("", "ignored?".to_string(), true);
        fields.add_text("title", String::new(), false);
        assert_eq!(fields.to_json(), json!({ "name": null, "title": "" }));
    }

    #[test]
    fn test_huge_index_is_a_key() {
        let mut fields = FormFields::new();
        fields.add("user[99999999]", "x".to_string());
        assert_eq!(fields.to_json(), json!({ "user": { "99999999": "x" } }));
    }

    #[test]
    fn test_values() {
        let mut fields = FormFields::new();
        fields.add("a[]", 1);
        fields.add("a[]", 2);
        fields.add("b[c]", 3);
        let mut values: Vec<i32> = fields.values().into_iter().copied().collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(fields.get("a").and_then(FormNode::first_value), Some(&1));
    }
}
