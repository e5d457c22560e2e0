//! Keypath notation: dot-separated, with `foo.bar[0]` and `foo.bar.0`
//! equivalent, negative indices counting from the end (spec §4.4).

use crate::error::QueryError;

/// One hop in a parsed keypath: a property name, or a collection index
/// (possibly negative).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(i64),
}

/// A parsed dot-and-bracket keypath. The last segment must be a `Key` —
/// every keypath ultimately names a property, even if it threads through
/// several collection indices to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath(Vec<Segment>);

impl KeyPath {
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        if raw.is_empty() {
            return Err(QueryError::MalformedKeyPath(raw.to_string()));
        }
        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(QueryError::MalformedKeyPath(raw.to_string()));
            }
            let mut rest = part;
            match rest.find('[') {
                None => {
                    // A bare numeric segment (`foo.0`) is an index;
                    // anything else is a property name.
                    match rest.parse::<i64>() {
                        Ok(n) => segments.push(Segment::Index(n)),
                        Err(_) => segments.push(Segment::Key(rest.to_string())),
                    }
                }
                Some(bracket_at) => {
                    let key = &rest[..bracket_at];
                    if key.is_empty() {
                        return Err(QueryError::MalformedKeyPath(raw.to_string()));
                    }
                    segments.push(Segment::Key(key.to_string()));
                    rest = &rest[bracket_at..];
                    while let Some(stripped) = rest.strip_prefix('[') {
                        let close = stripped
                            .find(']')
                            .ok_or_else(|| QueryError::MalformedKeyPath(raw.to_string()))?;
                        let inner = &stripped[..close];
                        let idx: i64 = inner
                            .parse()
                            .map_err(|_| QueryError::MalformedKeyPath(raw.to_string()))?;
                        segments.push(Segment::Index(idx));
                        rest = &stripped[close + 1..];
                    }
                    if !rest.is_empty() {
                        return Err(QueryError::MalformedKeyPath(raw.to_string()));
                    }
                }
            }
        }
        if !matches!(segments.last(), Some(Segment::Key(_))) {
            return Err(QueryError::MalformedKeyPath(raw.to_string()));
        }
        Ok(KeyPath(segments))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// The final segment's property name — always present, `parse`
    /// rejects any keypath that doesn't end in a `Key`.
    pub fn final_property(&self) -> &str {
        match self.0.last() {
            Some(Segment::Key(name)) => name,
            _ => unreachable!("KeyPath::parse guarantees the last segment is a Key"),
        }
    }
}

/// Resolve a (possibly negative) index against a collection of length
/// `len`, per spec §8's testable property 8: `a.b[-1]` is the last
/// element; `a.b[-len-1]` is a *Reference* error.
pub fn resolve_index(len: usize, idx: i64) -> Result<usize, QueryError> {
    if idx >= 0 {
        let i = idx as usize;
        if i < len {
            Ok(i)
        } else {
            Err(QueryError::IndexOutOfRange { index: idx, len })
        }
    } else {
        let from_end = (-idx) as usize;
        if from_end <= len {
            Ok(len - from_end)
        } else {
            Err(QueryError::IndexOutOfRange { index: idx, len })
        }
    }
}
