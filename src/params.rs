//! Statement parameters: placeholder parsing, bind targets and slot resolution.
//!
//! SQL text may use `?` (positional) and `:name` (named) markers. Named
//! markers are rewritten to `?` before the text is sent to the server, and
//! every occurrence of the same name maps to its own positional slot.
//!
//! When a statement is executed, each slot is filled from, in order:
//! 1. the call's arguments (positional arguments for unnamed slots, named
//!    arguments for named slots),
//! 2. the value pre-bound on the statement,
//! 3. otherwise execution fails with [`Error::MissingParameter`] before any
//!    bytes are written.

use crate::error::{Error, Result};
use crate::value::Value;

/// SQL text with named markers rewritten to `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    pub sql: String,
    /// One entry per `?` in `sql`: the marker name, or `None` for `?`.
    pub slots: Vec<Option<String>>,
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Rewrite `:name` markers to `?` and record the slot layout.
///
/// Markers inside string literals, quoted identifiers and comments are left
/// alone, as is `::`.
pub fn parse_placeholders(sql: &str) -> ParsedSql {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut slots = Vec::new();
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        // Doubled quote is an escaped quote
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_none_or(|c| c.is_ascii_whitespace()) =>
            {
                i = memchr::memchr(b'\n', &bytes[i..]).map_or(bytes.len(), |p| i + p);
            }
            b'#' => {
                i = memchr::memchr(b'\n', &bytes[i..]).map_or(bytes.len(), |p| i + p);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = memchr::memmem::find(&bytes[i + 2..], b"*/").map_or(bytes.len(), |p| i + 2 + p + 2);
            }
            b'?' => {
                slots.push(None);
                i += 1;
            }
            b':' if bytes.get(i + 1) == Some(&b':') => {
                i += 2;
            }
            b':' if bytes.get(i + 1).is_some_and(|&c| is_name_start(c)) => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_name_char(bytes[end]) {
                    end += 1;
                }
                out.push_str(&sql[copied..i]);
                out.push('?');
                slots.push(Some(sql[start..end].to_string()));
                i = end;
                copied = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    ParsedSql { sql: out, slots }
}

/// Target of a `bind` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindTarget {
    /// Zero-based slot position
    Index(usize),
    /// Declared `:name` marker
    Name(String),
}

impl From<usize> for BindTarget {
    fn from(idx: usize) -> Self {
        BindTarget::Index(idx)
    }
}

impl From<&str> for BindTarget {
    fn from(name: &str) -> Self {
        BindTarget::Name(name.trim_start_matches(':').to_string())
    }
}

impl From<String> for BindTarget {
    fn from(name: String) -> Self {
        BindTarget::from(name.as_str())
    }
}

impl std::fmt::Display for BindTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindTarget::Index(i) => write!(f, "parameter #{i}"),
            BindTarget::Name(n) => write!(f, ":{n}"),
        }
    }
}

/// Arguments for one execution.
///
/// Positional arguments fill unnamed slots in order; a [`skip`](Self::skip)
/// leaves that slot to its pre-bound value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    positional: Vec<Option<Value>>,
    named: Vec<(String, Value)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(Some(value.into()));
        self
    }

    /// Leave the next unnamed slot to its pre-bound value.
    pub fn skip(mut self) -> Self {
        self.positional.push(None);
        self
    }

    /// Set a named argument. A leading `:` is ignored.
    pub fn named(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.named
            .push((name.trim_start_matches(':').to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::default()
    }
}

impl<T: Into<Value>> From<Vec<T>> for Params {
    fn from(values: Vec<T>) -> Self {
        Params {
            positional: values.into_iter().map(|v| Some(v.into())).collect(),
            named: Vec::new(),
        }
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Params {
    fn from(values: [T; N]) -> Self {
        Params {
            positional: values.into_iter().map(|v| Some(v.into())).collect(),
            named: Vec::new(),
        }
    }
}

macro_rules! impl_params_tuple {
    ($($t:ident => $idx:tt),+) => {
        impl<$($t: Into<Value>),+> From<($($t,)+)> for Params {
            fn from(values: ($($t,)+)) -> Self {
                Params {
                    positional: vec![$(Some(values.$idx.into())),+],
                    named: Vec::new(),
                }
            }
        }
    };
}

impl_params_tuple!(T1 => 0);
impl_params_tuple!(T1 => 0, T2 => 1);
impl_params_tuple!(T1 => 0, T2 => 1, T3 => 2);
impl_params_tuple!(T1 => 0, T2 => 1, T3 => 2, T4 => 3);
impl_params_tuple!(T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4);
impl_params_tuple!(T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4, T6 => 5);

/// Slot layout of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamLayout {
    slots: Vec<Option<String>>,
    /// name → slots, in first-appearance order
    names: Vec<(String, Vec<usize>)>,
}

impl ParamLayout {
    pub fn new(slots: Vec<Option<String>>) -> Self {
        let mut names: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, slot) in slots.iter().enumerate() {
            let Some(name) = slot else { continue };
            match names.iter_mut().find(|(n, _)| n == name) {
                Some((_, positions)) => positions.push(idx),
                None => names.push((name.clone(), vec![idx])),
            }
        }
        Self { slots, names }
    }

    /// Layout with `count` unnamed slots.
    pub fn unnamed(count: usize) -> Self {
        Self::new(vec![None; count])
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Declared names with their slots.
    pub fn names(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.names.iter().map(|(n, s)| (n.as_str(), s.as_slice()))
    }

    fn slots_of(&self, name: &str) -> Option<&[usize]> {
        self.names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
    }

    /// Slots addressed by a bind target.
    pub fn resolve_target(&self, target: &BindTarget) -> Result<Vec<usize>> {
        match target {
            BindTarget::Index(idx) if *idx < self.slots.len() => Ok(vec![*idx]),
            BindTarget::Index(idx) => Err(Error::InvalidBind(format!(
                "position {idx} out of range (statement has {} parameters)",
                self.slots.len()
            ))),
            BindTarget::Name(name) => self
                .slots_of(name)
                .map(<[usize]>::to_vec)
                .ok_or_else(|| Error::InvalidBind(format!("undeclared parameter :{name}"))),
        }
    }

    /// Apply a bind to the pre-bound values, accumulating onto existing ones.
    pub fn bind(&self, bound: &mut PreBound, target: &BindTarget, value: Value) -> Result<()> {
        let slots = self.resolve_target(target)?;
        bound.values.resize(self.slots.len(), None);
        // Validate every slot before mutating any of them
        let mut updated = Vec::with_capacity(slots.len());
        for &slot in &slots {
            let next = match &bound.values[slot] {
                None => value.clone(),
                Some(existing) => existing.append(&value)?,
            };
            updated.push((slot, next));
        }
        for (slot, next) in updated {
            bound.values[slot] = Some(next);
        }
        Ok(())
    }

    /// Produce one value per slot for an execution.
    pub fn resolve(&self, bound: &PreBound, params: &Params) -> Result<Vec<Value>> {
        let mut values: Vec<Option<Value>> = vec![None; self.slots.len()];

        let mut positional = params.positional.iter();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                continue;
            }
            match positional.next() {
                Some(Some(v)) => values[idx] = Some(v.clone()),
                Some(None) | None => {}
            }
        }
        let extra = positional.count();
        if extra > 0 {
            return Err(Error::InvalidBind(format!(
                "{extra} positional argument(s) more than unnamed parameters"
            )));
        }

        for (name, value) in &params.named {
            let slots = self
                .slots_of(name)
                .ok_or_else(|| Error::InvalidBind(format!("undeclared parameter :{name}")))?;
            for &slot in slots {
                values[slot] = Some(value.clone());
            }
        }

        values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                value
                    .or_else(|| bound.get(idx).cloned())
                    .ok_or_else(|| {
                        Error::MissingParameter(match &self.slots[idx] {
                            Some(name) => format!(":{name}"),
                            None => format!("parameter #{idx}"),
                        })
                    })
            })
            .collect()
    }
}

/// Values pre-bound on a statement, one optional entry per slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreBound {
    values: Vec<Option<Value>>,
}

impl PreBound {
    pub fn get(&self, slot: usize) -> Option<&Value> {
        self.values.get(slot).and_then(Option::as_ref)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}
