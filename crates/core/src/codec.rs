//! Depth- and size-bounded JSON encoding.
//!
//! Every value crossing the boundary in either direction goes through here.
//! Encoding stops the moment the byte ceiling is crossed instead of building
//! the whole buffer first; depth is measured with an explicit stack so a
//! pathological value cannot exhaust the host stack.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecLimits {
    /// Maximum container nesting (objects and arrays).
    pub max_depth: usize,
    /// Maximum encoded size in bytes.
    pub max_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("value nesting exceeds depth {limit}")]
    TooDeep { limit: usize },
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Fail if any container in `value` sits deeper than `limit`.
pub fn check_depth(value: &Value, limit: usize) -> Result<(), CodecError> {
    let mut stack = vec![(value, 1usize)];
    while let Some((current, depth)) = stack.pop() {
        match current {
            Value::Array(items) => {
                if depth > limit {
                    return Err(CodecError::TooDeep { limit });
                }
                stack.extend(items.iter().map(|child| (child, depth + 1)));
            }
            Value::Object(map) => {
                if depth > limit {
                    return Err(CodecError::TooDeep { limit });
                }
                stack.extend(map.values().map(|child| (child, depth + 1)));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Encode `value` to JSON bytes within `limits`.
pub fn encode(value: &Value, limits: &CodecLimits) -> Result<Vec<u8>, CodecError> {
    check_depth(value, limits.max_depth)?;
    let mut writer = LimitedWriter::new(limits.max_bytes);
    match serde_json::to_writer(&mut writer, value) {
        Ok(()) => Ok(writer.buf),
        Err(_) if writer.overflowed => Err(CodecError::PayloadTooLarge {
            limit: limits.max_bytes,
        }),
        Err(e) => Err(CodecError::Malformed(e.to_string())),
    }
}

/// Decode JSON bytes within `limits`.
pub fn decode(bytes: &[u8], limits: &CodecLimits) -> Result<Value, CodecError> {
    if bytes.len() > limits.max_bytes {
        return Err(CodecError::PayloadTooLarge {
            limit: limits.max_bytes,
        });
    }
    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
        // serde_json's own recursion guard trips before ours on very deep input
        if e.to_string().contains("recursion limit") {
            CodecError::TooDeep {
                limit: limits.max_depth,
            }
        } else {
            CodecError::Malformed(e.to_string())
        }
    })?;
    check_depth(&value, limits.max_depth)?;
    Ok(value)
}

/// Decode into a typed value within `limits`.
pub fn decode_as<T: DeserializeOwned>(bytes: &[u8], limits: &CodecLimits) -> Result<T, CodecError> {
    let value = decode(bytes, limits)?;
    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Running encoded size of a JSON array assembled one element at a time.
///
/// Producers charge each element before keeping it, so a result is abandoned
/// as soon as it would cross `max_bytes` rather than after it is built.
#[derive(Debug, Clone)]
pub struct ByteBudget {
    limit: usize,
    used: usize,
    elements: usize,
}

impl ByteBudget {
    pub fn new(limits: &CodecLimits) -> Self {
        Self {
            limit: limits.max_bytes,
            used: 2,
            elements: 0,
        }
    }

    /// Bytes the array would encode to so far, brackets included.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Account for one more element and its separator.
    pub fn charge(&mut self, value: &Value) -> Result<(), CodecError> {
        let separator = usize::from(self.elements > 0);
        let mut counter = CountingWriter {
            count: 0,
            remaining: self.limit.saturating_sub(self.used + separator),
            overflowed: false,
        };
        match serde_json::to_writer(&mut counter, value) {
            Ok(()) => {
                self.used += separator + counter.count;
                self.elements += 1;
                Ok(())
            }
            Err(_) if counter.overflowed => Err(CodecError::PayloadTooLarge { limit: self.limit }),
            Err(e) => Err(CodecError::Malformed(e.to_string())),
        }
    }
}

struct CountingWriter {
    count: usize,
    remaining: usize,
    overflowed: bool,
}

impl io::Write for CountingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.count + data.len() > self.remaining {
            self.overflowed = true;
            return Err(io::Error::new(io::ErrorKind::Other, "payload ceiling reached"));
        }
        self.count += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct LimitedWriter {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl LimitedWriter {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            overflowed: false,
        }
    }
}

impl io::Write for LimitedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            return Err(io::Error::new(io::ErrorKind::Other, "payload ceiling reached"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
