//! Shared plumbing for saving and loading state.
//!
//! Two formats are supported:
//! - The tagged text format: a marker word, an integer version, whitespace separated fields in a
//!   fixed order and a closing `~Marker`. `TokenReader` reads it back token by token.
//! - Binary snapshots: a small versioned header followed by the `bincode` encoding of the value.
//!   Binary snapshots keep the complete internal state, free lists included.

use crate::error::{HtmError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{BufRead, Read, Write};
use std::str::FromStr;

/// Reads whitespace separated tokens from a text stream.
pub struct TokenReader<R> {
    input: R,
    line: String,
    pending: std::vec::IntoIter<String>,
}

impl<R: BufRead> TokenReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: String::new(),
            pending: Vec::new().into_iter(),
        }
    }

    /// Returns the next token, reading more lines as needed.
    pub fn next_token(&mut self) -> Result<String> {
        loop {
            if let Some(token) = self.pending.next() {
                return Ok(token);
            }

            self.line.clear();
            if self.input.read_line(&mut self.line)? == 0 {
                return Err(HtmError::Serialization("unexpected end of stream".into()));
            }
            self.pending = self
                .line
                .split_whitespace()
                .map(str::to_owned)
                .collect::<Vec<_>>()
                .into_iter();
        }
    }

    /// Parses the next token as `T`.
    pub fn parse<T: FromStr>(&mut self) -> Result<T> {
        let token = self.next_token()?;
        token.parse::<T>().map_err(|_| {
            HtmError::Serialization(format!(
                "cannot parse `{token}` as {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Parses a boolean written either as `0`/`1` or `false`/`true`.
    pub fn parse_bool(&mut self) -> Result<bool> {
        match self.next_token()?.as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(HtmError::Serialization(format!("cannot parse `{other}` as bool"))),
        }
    }

    /// Consumes the next token and checks that it is `marker`.
    pub fn expect_marker(&mut self, marker: &str) -> Result<()> {
        let token = self.next_token()?;
        if token != marker {
            return Err(HtmError::Serialization(format!(
                "expected marker `{marker}`, found `{token}`"
            )));
        }
        Ok(())
    }

    /// Consumes a version number and checks that it equals `version`.
    pub fn expect_version(&mut self, version: u32) -> Result<u32> {
        let found = self.parse::<u32>()?;
        if found != version {
            return Err(HtmError::Serialization(format!(
                "unsupported version {found}, expected {version}"
            )));
        }
        Ok(found)
    }

    /// Reads a length-prefixed list of values.
    pub fn parse_vec<T: FromStr>(&mut self) -> Result<Vec<T>> {
        let len = self.parse::<usize>()?;
        (0..len).map(|_| self.parse::<T>()).collect()
    }
}

/// Writes a length-prefixed list of values on one line.
pub fn write_vec<W: Write, T: std::fmt::Display>(out: &mut W, values: &[T]) -> Result<()> {
    write!(out, "{} ", values.len())?;
    for value in values {
        write!(out, "{value} ")?;
    }
    writeln!(out)?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    marker: String,
    version: u32,
}

/// Writes `value` as a binary snapshot tagged with `marker` and `version`.
pub fn save_binary<W: Write, T: Serialize>(
    out: &mut W,
    marker: &str,
    version: u32,
    value: &T,
) -> Result<()> {
    let header = SnapshotHeader {
        marker: marker.to_owned(),
        version,
    };
    bincode::serialize_into(&mut *out, &header)?;
    bincode::serialize_into(&mut *out, value)?;
    Ok(())
}

/// Reads a binary snapshot written by [`save_binary`], rejecting other markers and versions.
pub fn load_binary<R: Read, T: DeserializeOwned>(
    input: &mut R,
    marker: &str,
    version: u32,
) -> Result<T> {
    let header: SnapshotHeader = bincode::deserialize_from(&mut *input)?;
    if header.marker != marker {
        return Err(HtmError::Serialization(format!(
            "expected snapshot of `{marker}`, found `{}`",
            header.marker
        )));
    }
    if header.version != version {
        return Err(HtmError::Serialization(format!(
            "unsupported {marker} snapshot version {}, expected {version}",
            header.version
        )));
    }
    Ok(bincode::deserialize_from(&mut *input)?)
}
