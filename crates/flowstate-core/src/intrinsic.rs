//! Intrinsic function resolver.
//!
//! Evaluates `States.Function(arg, ...)` expressions found in templates.
//! Arguments are split on top-level commas, then each one is resolved in
//! order: a nested intrinsic call, a `$$` context query, a `$` data query,
//! a JSON literal, or finally a bare string with its quotes stripped.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

use flowstate_types::{ErrorKind, StatesError};

use crate::path::{JsonPath, PathError, PathRoot};

/// Keyword prefix that marks a string as an intrinsic call.
pub const INTRINSIC_PREFIX: &str = "States.";

/// Largest list `States.ArrayRange` will build.
const MAX_RANGE_ITEMS: usize = 1000;

/// Failure inside a single intrinsic evaluation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntrinsicError {
    #[error("malformed expression: {0}")]
    Malformed(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("nesting deeper than {0} calls")]
    TooDeep(usize),

    #[error("{function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Evaluates intrinsic expressions against a data value and a context value.
#[derive(Debug, Clone)]
pub struct IntrinsicResolver {
    max_depth: usize,
}

impl Default for IntrinsicResolver {
    fn default() -> Self {
        Self::new(10)
    }
}

impl IntrinsicResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Whether `expr` looks like an intrinsic call.
    pub fn is_intrinsic(expr: &str) -> bool {
        expr.trim_start().starts_with(INTRINSIC_PREFIX)
    }

    /// Evaluate `expr`, mapping any failure to `States.IntrinsicFailure`
    /// naming the offending expression.
    pub fn evaluate(&self, expr: &str, data: &Value, context: &Value) -> Result<Value, StatesError> {
        self.eval(expr, data, context, 1).map_err(|e| {
            StatesError::new(ErrorKind::IntrinsicFailure, format!("'{expr}': {e}")).with_source(e)
        })
    }

    fn eval(
        &self,
        expr: &str,
        data: &Value,
        context: &Value,
        depth: usize,
    ) -> Result<Value, IntrinsicError> {
        if depth > self.max_depth {
            return Err(IntrinsicError::TooDeep(self.max_depth));
        }

        let (function, raw_args) = parse_call(expr)?;
        let mut args = Vec::new();
        for token in split_args(raw_args)? {
            args.push(self.resolve_arg(&token, data, context, depth)?);
        }
        call(function, args)
    }

    fn resolve_arg(
        &self,
        token: &str,
        data: &Value,
        context: &Value,
        depth: usize,
    ) -> Result<Value, IntrinsicError> {
        if Self::is_intrinsic(token) {
            return self.eval(token, data, context, depth + 1);
        }
        if token.starts_with('$') {
            let path = JsonPath::parse(token)?;
            let root = match path.root() {
                PathRoot::Context => context,
                PathRoot::Data => data,
            };
            return Ok(path.query(root)?);
        }
        if let Ok(value) = serde_json::from_str::<Value>(token) {
            return Ok(value);
        }
        Ok(Value::String(strip_quotes(token)))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Split `States.Name(args)` into `("Name", "args")`.
fn parse_call(expr: &str) -> Result<(&str, &str), IntrinsicError> {
    let malformed = || IntrinsicError::Malformed(expr.to_string());
    let body = expr.trim().strip_prefix(INTRINSIC_PREFIX).ok_or_else(malformed)?;
    let open = body.find('(').ok_or_else(malformed)?;
    let inner = body[open + 1..].strip_suffix(')').ok_or_else(malformed)?;
    let name = &body[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(malformed());
    }
    Ok((name, inner))
}

/// Split on commas that are outside brackets and quotes.
fn split_args(raw: &str) -> Result<Vec<String>, IntrinsicError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in raw.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(IntrinsicError::Malformed(raw.to_string()));
                }
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if depth != 0 || quote.is_some() {
        return Err(IntrinsicError::Malformed(raw.to_string()));
    }
    let last = current.trim();
    if !last.is_empty() || !args.is_empty() {
        args.push(last.to_string());
    }
    Ok(args)
}

fn strip_quotes(token: &str) -> String {
    let stripped = ['\'', '"'].iter().find_map(|q| {
        token
            .strip_prefix(*q)
            .and_then(|rest| rest.strip_suffix(*q))
            .map(|inner| inner.replace(&format!("\\{q}"), &q.to_string()))
    });
    stripped.unwrap_or_else(|| token.to_string())
}

// ---------------------------------------------------------------------------
// Function catalogue
// ---------------------------------------------------------------------------

fn call(function: &str, args: Vec<Value>) -> Result<Value, IntrinsicError> {
    let f = Args { function, args };
    match function {
        "Format" => f.format(),
        "StringToJson" => {
            f.arity(1)?;
            let text = f.string(0)?;
            serde_json::from_str(text).map_err(|e| f.invalid(&format!("invalid JSON: {e}")))
        }
        "JsonToString" => {
            f.arity(1)?;
            Ok(Value::String(f.args[0].to_string()))
        }
        "Array" => Ok(Value::Array(f.args)),
        "ArrayPartition" => {
            f.arity(2)?;
            let items = f.array(0)?;
            let size = f.integer(1)?;
            if size <= 0 {
                return Err(f.invalid("chunk size must be positive"));
            }
            let chunks = items
                .chunks(size as usize)
                .map(|chunk| Value::Array(chunk.to_vec()))
                .collect();
            Ok(Value::Array(chunks))
        }
        "ArrayContains" => {
            f.arity(2)?;
            Ok(Value::Bool(f.array(0)?.contains(&f.args[1])))
        }
        "ArrayRange" => f.range(),
        "ArrayGetItem" => {
            f.arity(2)?;
            let items = f.array(0)?;
            let index = f.integer(1)?;
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| f.invalid(&format!("index {index} out of range")))
        }
        "ArrayLength" => {
            f.arity(1)?;
            Ok(json!(f.array(0)?.len()))
        }
        "ArrayUnique" => {
            f.arity(1)?;
            let mut unique: Vec<Value> = Vec::new();
            for item in f.array(0)? {
                if !unique.contains(item) {
                    unique.push(item.clone());
                }
            }
            Ok(Value::Array(unique))
        }
        "Base64Encode" => {
            f.arity(1)?;
            Ok(Value::String(STANDARD.encode(f.string(0)?)))
        }
        "Base64Decode" => {
            f.arity(1)?;
            let bytes = STANDARD
                .decode(f.string(0)?)
                .map_err(|e| f.invalid(&format!("invalid base64: {e}")))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| f.invalid("decoded bytes are not UTF-8"))
        }
        "Hash" => f.hash(),
        "JsonMerge" => f.merge(),
        "MathRandom" => f.random(),
        "MathAdd" => {
            f.arity(2)?;
            let sum = f
                .integer(0)?
                .checked_add(f.integer(1)?)
                .ok_or_else(|| f.invalid("integer overflow"))?;
            Ok(json!(sum))
        }
        "UUID" => {
            f.arity(0)?;
            Ok(Value::String(uuid::Uuid::new_v4().to_string()))
        }
        "StringSplit" => {
            f.arity(2)?;
            let text = f.string(0)?;
            let delimiters = f.string(1)?;
            let parts = text
                .split(|c: char| delimiters.contains(c))
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect();
            Ok(Value::Array(parts))
        }
        other => Err(IntrinsicError::UnknownFunction(format!("States.{other}"))),
    }
}

/// Positional arguments of one call, with typed accessors.
struct Args<'a> {
    function: &'a str,
    args: Vec<Value>,
}

impl Args<'_> {
    fn invalid(&self, reason: &str) -> IntrinsicError {
        IntrinsicError::InvalidArguments {
            function: format!("States.{}", self.function),
            reason: reason.to_string(),
        }
    }

    fn arity(&self, expected: usize) -> Result<(), IntrinsicError> {
        if self.args.len() == expected {
            Ok(())
        } else {
            Err(self.invalid(&format!(
                "expected {expected} argument(s), got {}",
                self.args.len()
            )))
        }
    }

    fn string(&self, i: usize) -> Result<&str, IntrinsicError> {
        self.args[i]
            .as_str()
            .ok_or_else(|| self.invalid(&format!("argument {} must be a string", i + 1)))
    }

    fn integer(&self, i: usize) -> Result<i64, IntrinsicError> {
        let value = &self.args[i];
        value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| self.invalid(&format!("argument {} must be an integer", i + 1)))
    }

    fn array(&self, i: usize) -> Result<&Vec<Value>, IntrinsicError> {
        self.args[i]
            .as_array()
            .ok_or_else(|| self.invalid(&format!("argument {} must be an array", i + 1)))
    }

    fn format(&self) -> Result<Value, IntrinsicError> {
        if self.args.is_empty() {
            return Err(self.invalid("missing template"));
        }
        let template = self.string(0)?;
        let mut values = self.args[1..].iter();
        let mut out = String::new();
        let mut rest = template;
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            let value = values
                .next()
                .ok_or_else(|| self.invalid("not enough arguments for template"))?;
            match value {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn range(&self) -> Result<Value, IntrinsicError> {
        self.arity(3)?;
        let (start, end, step) = (self.integer(0)?, self.integer(1)?, self.integer(2)?);
        if step == 0 {
            return Err(self.invalid("step must not be zero"));
        }
        let mut items = Vec::new();
        let mut n = start;
        while (step > 0 && n <= end) || (step < 0 && n >= end) {
            if items.len() == MAX_RANGE_ITEMS {
                return Err(self.invalid(&format!("range exceeds {MAX_RANGE_ITEMS} items")));
            }
            items.push(json!(n));
            n = match n.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(Value::Array(items))
    }

    fn hash(&self) -> Result<Value, IntrinsicError> {
        self.arity(2)?;
        let data = match &self.args[0] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let bytes = data.as_bytes();
        let digest = match self.string(1)? {
            "MD5" => format!("{:x}", Md5::digest(bytes)),
            "SHA-1" => format!("{:x}", Sha1::digest(bytes)),
            "SHA-256" => format!("{:x}", Sha256::digest(bytes)),
            "SHA-384" => format!("{:x}", Sha384::digest(bytes)),
            "SHA-512" => format!("{:x}", Sha512::digest(bytes)),
            other => return Err(self.invalid(&format!("unsupported algorithm '{other}'"))),
        };
        Ok(Value::String(digest))
    }

    fn merge(&self) -> Result<Value, IntrinsicError> {
        if !(2..=3).contains(&self.args.len()) {
            return Err(self.invalid("expected 2 or 3 arguments"));
        }
        if self.args.get(2).and_then(Value::as_bool) == Some(true) {
            return Err(self.invalid("deep merge is not supported"));
        }
        let (Some(left), Some(right)) = (self.args[0].as_object(), self.args[1].as_object())
        else {
            return Err(self.invalid("both arguments must be objects"));
        };
        let mut merged: Map<String, Value> = left.clone();
        for (k, v) in right {
            merged.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(merged))
    }

    fn random(&self) -> Result<Value, IntrinsicError> {
        if !(2..=3).contains(&self.args.len()) {
            return Err(self.invalid("expected 2 or 3 arguments"));
        }
        let (start, end) = (self.integer(0)?, self.integer(1)?);
        if start >= end {
            return Err(self.invalid("start must be less than end"));
        }
        let n = match self.args.get(2) {
            Some(_) => StdRng::seed_from_u64(self.integer(2)? as u64).gen_range(start..end),
            None => rand::thread_rng().gen_range(start..end),
        };
        Ok(json!(n))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
