//! Reference paths into JSON values.
//!
//! Supported syntax:
//!
//! | Form          | Meaning                                   |
//! |---------------|-------------------------------------------|
//! | `$`           | the data root                             |
//! | `$$`          | the context object root                   |
//! | `.name`       | object member                             |
//! | `['name']`    | object member (quoted, any characters)    |
//! | `[n]`         | array element, negative counts from end   |
//! | `[*]`, `.*`   | every element / member                    |
//! | `[a:b]`       | array slice, half-open                    |
//! | `..name`      | recursive descent                         |
//!
//! A path made only of members and indexes is *definite*: querying it yields
//! a single value or fails. Any other path yields a (possibly empty) list.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from parsing, querying or assigning through a path.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PathError {
    #[error("invalid path '{path}': {reason}")]
    Syntax { path: String, reason: String },

    #[error("path '{0}' did not match any value")]
    NotFound(String),

    #[error("cannot assign through '{path}': {reason}")]
    NotAssignable { path: String, reason: String },
}

/// Which root a path starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    Data,
    Context,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    Slice(Option<i64>, Option<i64>),
    Descend(Option<String>),
}

impl Segment {
    fn is_definite(&self) -> bool {
        matches!(self, Segment::Field(_) | Segment::Index(_))
    }
}

/// A parsed reference path.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    source: String,
    root: PathRoot,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse a path expression.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        Parser::new(path).parse()
    }

    /// The source text this path was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> PathRoot {
        self.root
    }

    /// True when the path is just `$` (or `$$`).
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when the path can select at most one value.
    pub fn is_definite(&self) -> bool {
        self.segments.iter().all(Segment::is_definite)
    }

    /// Select from `value`.
    ///
    /// Definite paths return the single matching value or `NotFound`.
    /// Indefinite paths return an array of every match.
    pub fn query(&self, value: &Value) -> Result<Value, PathError> {
        let mut current = vec![value];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                select(segment, node, &mut next);
            }
            current = next;
        }

        if self.is_definite() {
            current
                .first()
                .map(|v| (*v).clone())
                .ok_or_else(|| PathError::NotFound(self.source.clone()))
        } else {
            Ok(Value::Array(current.into_iter().cloned().collect()))
        }
    }

    /// Return a copy of `target` with `value` written at this path.
    ///
    /// Missing intermediate object members are created. Assigning through a
    /// scalar, an out-of-range index, or an indefinite segment fails.
    pub fn assign(&self, target: &Value, value: Value) -> Result<Value, PathError> {
        if self.root == PathRoot::Context {
            return Err(self.not_assignable("context paths are read-only"));
        }
        if !self.is_definite() {
            return Err(self.not_assignable("path is not definite"));
        }
        let mut out = target.clone();
        self.assign_into(&mut out, &self.segments, value)?;
        Ok(out)
    }

    fn assign_into(
        &self,
        slot: &mut Value,
        segments: &[Segment],
        value: Value,
    ) -> Result<(), PathError> {
        let Some((head, rest)) = segments.split_first() else {
            *slot = value;
            return Ok(());
        };

        match head {
            Segment::Field(name) => {
                if slot.is_null() {
                    *slot = Value::Object(Map::new());
                }
                let Value::Object(map) = slot else {
                    return Err(self.not_assignable(&format!(
                        "cannot set member '{name}' on a non-object"
                    )));
                };
                let child = map.entry(name.clone()).or_insert(Value::Null);
                self.assign_into(child, rest, value)
            }
            Segment::Index(index) => {
                let Value::Array(items) = slot else {
                    return Err(self.not_assignable(&format!(
                        "cannot set index {index} on a non-array"
                    )));
                };
                let len = items.len();
                let Some(pos) = resolve_index(*index, len) else {
                    return Err(self.not_assignable(&format!(
                        "index {index} out of range for array of length {len}"
                    )));
                };
                self.assign_into(&mut items[pos], rest, value)
            }
            _ => Err(self.not_assignable("path is not definite")),
        }
    }

    fn not_assignable(&self, reason: &str) -> PathError {
        PathError::NotAssignable {
            path: self.source.clone(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let pos = if index < 0 { len + index } else { index };
    (0..len).contains(&pos).then_some(pos as usize)
}

fn select<'v>(segment: &Segment, node: &'v Value, out: &mut Vec<&'v Value>) {
    match segment {
        Segment::Field(name) => {
            if let Some(v) = node.as_object().and_then(|m| m.get(name)) {
                out.push(v);
            }
        }
        Segment::Index(index) => {
            if let Some(items) = node.as_array() {
                if let Some(pos) = resolve_index(*index, items.len()) {
                    out.push(&items[pos]);
                }
            }
        }
        Segment::Wildcard => match node {
            Value::Object(map) => out.extend(map.values()),
            Value::Array(items) => out.extend(items.iter()),
            _ => {}
        },
        Segment::Slice(start, end) => {
            if let Some(items) = node.as_array() {
                let len = items.len() as i64;
                let clamp = |i: i64| -> usize {
                    let i = if i < 0 { len + i } else { i };
                    i.clamp(0, len) as usize
                };
                let from = clamp(start.unwrap_or(0));
                let to = clamp(end.unwrap_or(len));
                if from < to {
                    out.extend(items[from..to].iter());
                }
            }
        }
        Segment::Descend(name) => descend(name.as_deref(), node, out),
    }
}

fn descend<'v>(name: Option<&str>, node: &'v Value, out: &mut Vec<&'v Value>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                if name.is_none_or(|n| n == key) {
                    out.push(child);
                }
            }
            for child in map.values() {
                descend(name, child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                if name.is_none() {
                    out.push(child);
                }
            }
            for child in items {
                descend(name, child, out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<JsonPath, PathError> {
        if !self.eat('$') {
            return Err(self.error("must start with '$'"));
        }
        let root = if self.eat('$') {
            PathRoot::Context
        } else {
            PathRoot::Data
        };

        let mut segments = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.pos += 1;
                    if self.eat('.') {
                        let name = if self.eat('*') {
                            None
                        } else {
                            Some(self.name()?)
                        };
                        segments.push(Segment::Descend(name));
                    } else if self.eat('*') {
                        segments.push(Segment::Wildcard);
                    } else {
                        segments.push(Segment::Field(self.name()?));
                    }
                }
                '[' => {
                    self.pos += 1;
                    segments.push(self.bracket()?);
                }
                other => return Err(self.error(&format!("unexpected character '{other}'"))),
            }
        }

        Ok(JsonPath {
            source: self.source.to_string(),
            root,
            segments,
        })
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// A dot-notation member name. Brackets, quotes and whitespace end it;
    /// `parse` rejects whichever of them is left over.
    fn name(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '.' | '[' | ']' | '\'' | '"') || c.is_whitespace() {
                break;
            }
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("empty member name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn bracket(&mut self) -> Result<Segment, PathError> {
        let segment = match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated quoted member"));
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Segment::Field(name)
            }
            Some('*') => {
                self.pos += 1;
                Segment::Wildcard
            }
            _ => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c != ']') {
                    self.pos += 1;
                }
                let body: String = self.chars[start..self.pos].iter().collect();
                self.index_or_slice(body.trim())?
            }
        };
        if !self.eat(']') {
            return Err(self.error("expected ']'"));
        }
        Ok(segment)
    }

    fn index_or_slice(&self, body: &str) -> Result<Segment, PathError> {
        let parse_int = |s: &str| -> Result<Option<i64>, PathError> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>()
                .map(Some)
                .map_err(|_| self.error(&format!("invalid index '{s}'")))
        };

        match body.split_once(':') {
            Some((from, to)) => Ok(Segment::Slice(parse_int(from)?, parse_int(to)?)),
            None => parse_int(body)?
                .map(Segment::Index)
                .ok_or_else(|| self.error("empty index")),
        }
    }

    fn error(&self, reason: &str) -> PathError {
        PathError::Syntax {
            path: self.source.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "store": {
                "book": [
                    { "title": "A", "price": 8 },
                    { "title": "B", "price": 12 },
                    { "title": "C", "price": 9 }
                ],
                "bicycle": { "price": 20 }
            },
            "odd key": 1
        })
    }

    fn q(path: &str, value: &Value) -> Value {
        JsonPath::parse(path).unwrap().query(value).unwrap()
    }

    // -----------------------------------------------------------------------
    // parse
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_roots() {
        assert_eq!(JsonPath::parse("$").unwrap().root(), PathRoot::Data);
        assert_eq!(JsonPath::parse("$$.State").unwrap().root(), PathRoot::Context);
        assert!(JsonPath::parse("$").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "", "store", "$.", "$[", "$['x'", "$[abc]", "$.a]", "$.a'b", "$.a b", "$..x]",
        ] {
            assert!(
                matches!(JsonPath::parse(bad), Err(PathError::Syntax { .. })),
                "expected syntax error for {bad:?}"
            );
        }
    }

    #[test]
    fn test_definiteness() {
        assert!(JsonPath::parse("$.a[0]['b']").unwrap().is_definite());
        assert!(!JsonPath::parse("$.a[*]").unwrap().is_definite());
        assert!(!JsonPath::parse("$..price").unwrap().is_definite());
        assert!(!JsonPath::parse("$.a[0:2]").unwrap().is_definite());
    }

    // -----------------------------------------------------------------------
    // query
    // -----------------------------------------------------------------------

    #[test]
    fn test_query_definite() {
        let d = doc();
        assert_eq!(q("$", &d), d);
        assert_eq!(q("$.store.book[1].title", &d), json!("B"));
        assert_eq!(q("$.store.book[-1].title", &d), json!("C"));
        assert_eq!(q("$['odd key']", &d), json!(1));
    }

    #[test]
    fn test_query_definite_missing_is_error() {
        let d = doc();
        let err = JsonPath::parse("$.store.car").unwrap().query(&d).unwrap_err();
        assert_eq!(err, PathError::NotFound("$.store.car".into()));
        assert!(JsonPath::parse("$.store.book[7]").unwrap().query(&d).is_err());
    }

    #[test]
    fn test_query_indefinite_returns_list() {
        let d = doc();
        assert_eq!(q("$.store.book[*].price", &d), json!([8, 12, 9]));
        assert_eq!(q("$.store.book[0:2].title", &d), json!(["A", "B"]));
        assert_eq!(q("$.store.book[-2:].title", &d), json!(["B", "C"]));
        assert_eq!(q("$.nothing[*]", &d), json!([]));
    }

    #[test]
    fn test_query_recursive_descent() {
        let d = doc();
        let prices = q("$..price", &d);
        let mut prices: Vec<i64> = prices
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        prices.sort();
        assert_eq!(prices, vec![8, 9, 12, 20]);
    }

    // -----------------------------------------------------------------------
    // assign
    // -----------------------------------------------------------------------

    #[test]
    fn test_assign_creates_intermediate_objects() {
        let path = JsonPath::parse("$.a.b.c").unwrap();
        let out = path.assign(&json!({ "keep": true }), json!(5)).unwrap();
        assert_eq!(out, json!({ "keep": true, "a": { "b": { "c": 5 } } }));
    }

    #[test]
    fn test_assign_root_replaces() {
        let path = JsonPath::parse("$").unwrap();
        assert_eq!(path.assign(&json!({ "x": 1 }), json!([1])).unwrap(), json!([1]));
    }

    #[test]
    fn test_assign_does_not_mutate_original() {
        let original = json!({ "x": 1 });
        let out = JsonPath::parse("$.x").unwrap().assign(&original, json!(2)).unwrap();
        assert_eq!(original, json!({ "x": 1 }));
        assert_eq!(out, json!({ "x": 2 }));
    }

    #[test]
    fn test_assign_into_array_index() {
        let out = JsonPath::parse("$.list[1].v")
            .unwrap()
            .assign(&json!({ "list": [{}, {}] }), json!("hit"))
            .unwrap();
        assert_eq!(out, json!({ "list": [{}, { "v": "hit" }] }));
    }

    #[test]
    fn test_assign_through_scalar_fails() {
        let err = JsonPath::parse("$.x.y")
            .unwrap()
            .assign(&json!({ "x": 3 }), json!(1))
            .unwrap_err();
        assert!(matches!(err, PathError::NotAssignable { .. }));
    }

    #[test]
    fn test_assign_rejects_context_and_indefinite() {
        assert!(JsonPath::parse("$$.x").unwrap().assign(&json!({}), json!(1)).is_err());
        assert!(JsonPath::parse("$.x[*]").unwrap().assign(&json!({}), json!(1)).is_err());
    }
}
