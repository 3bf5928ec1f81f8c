use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

pub const STATE_LEN: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("key schedule needs at least one key byte")]
    EmptyKey,

    #[error("state table must be {STATE_LEN} bytes, got {0}")]
    TableLength(usize),

    #[error("state table is not a permutation: value 0x{0:02x} repeats")]
    NotAPermutation(u8),

    #[error("invalid hex in state table: {0}")]
    InvalidHex(String),
}

/// RC4-compatible keystream: a 256-entry permutation plus the PRGA indices.
///
/// Applying the keystream is its own inverse, so the same call both enciphers
/// and deciphers; every call moves the stream position forward.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamCipher {
    state: [u8; STATE_LEN],
    x: u8,
    y: u8,
}

impl StreamCipher {
    /// Runs the key schedule over `key`, repeating it cyclically.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.is_empty() {
            return Err(CipherError::EmptyKey);
        }

        let mut state = [0u8; STATE_LEN];
        let mut j: u8 = 0;

        for (i, x) in state.iter_mut().enumerate() {
            *x = i as u8;
        }
        for i in 0..STATE_LEN {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Ok(Self { state, x: 0, y: 0 })
    }

    /// Restores an already-scheduled table at an explicit stream position.
    pub fn from_state(table: &[u8], x: u8, y: u8) -> Result<Self, CipherError> {
        let table = CandidateTable::try_from(table)?;
        Ok(Self::from_candidate(&table, x, y))
    }

    pub fn from_candidate(table: &CandidateTable, x: u8, y: u8) -> Self {
        Self {
            state: table.0,
            x,
            y,
        }
    }

    /// Overwrites this instance in place; the brute-force search reuses one scratch cipher.
    pub fn restore(&mut self, table: &CandidateTable, x: u8, y: u8) {
        self.state.copy_from_slice(&table.0);
        self.x = x;
        self.y = y;
    }

    /// Independent clone of the table at another position.
    pub fn copy_at(&self, x: u8, y: u8) -> Self {
        Self {
            state: self.state,
            x,
            y,
        }
    }

    pub fn next(&mut self) -> u8 {
        self.x = self.x.wrapping_add(1);
        self.y = self.y.wrapping_add(self.state[self.x as usize]);
        self.state.swap(self.x as usize, self.y as usize);
        self.state[(self.state[self.x as usize].wrapping_add(self.state[self.y as usize])) as usize]
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next();
        }
    }

    /// Steps the table and indices back `count` positions; the exact inverse
    /// of `count` calls to [`StreamCipher::next`].
    pub fn reverse(&mut self, count: usize) {
        for _ in 0..count {
            self.state.swap(self.x as usize, self.y as usize);
            self.y = self.y.wrapping_sub(self.state[self.x as usize]);
            self.x = self.x.wrapping_sub(1);
        }
    }

    pub fn x(&self) -> u8 {
        self.x
    }

    pub fn y(&self) -> u8 {
        self.y
    }

    pub fn position(&self) -> (u8, u8) {
        (self.x, self.y)
    }

    pub fn state(&self) -> &[u8; STATE_LEN] {
        &self.state
    }
}

impl Debug for StreamCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "StreamCipher(x={}, y={}, ", self.x, self.y)?;
        write_hex(f, &self.state)?;
        f.write_str(")")
    }
}

/// Upper-case hex dump of the table.
impl Display for StreamCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.state)
    }
}

/// A raw 256-byte table captured from outside the session, checked to be a permutation.
#[derive(Clone, PartialEq, Eq)]
pub struct CandidateTable([u8; STATE_LEN]);

impl CandidateTable {
    pub fn as_bytes(&self) -> &[u8; STATE_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for CandidateTable {
    type Error = CipherError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let table: [u8; STATE_LEN] = bytes
            .try_into()
            .map_err(|_| CipherError::TableLength(bytes.len()))?;

        let mut seen = [false; STATE_LEN];
        for &value in &table {
            if std::mem::replace(&mut seen[value as usize], true) {
                return Err(CipherError::NotAPermutation(value));
            }
        }
        Ok(Self(table))
    }
}

impl FromStr for CandidateTable {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        Self::try_from(bytes.as_slice())
    }
}

impl From<&StreamCipher> for CandidateTable {
    fn from(cipher: &StreamCipher) -> Self {
        Self(cipher.state)
    }
}

impl Debug for CandidateTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("CandidateTable(")?;
        write_hex(f, &self.0)?;
        f.write_str(")")
    }
}

fn write_hex(f: &mut Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02X}")?;
    }
    Ok(())
}

fn decode_hex(input: &str) -> Result<Vec<u8>, CipherError> {
    let clean = input.trim();
    if !clean.len().is_multiple_of(2) {
        return Err(CipherError::InvalidHex("hex length must be even".to_string()));
    }

    let mut out = Vec::with_capacity(clean.len() / 2);
    for pair in clean.as_bytes().chunks_exact(2) {
        out.push((hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?);
    }
    Ok(out)
}

fn hex_nibble(ch: u8) -> Result<u8, CipherError> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        _ => Err(CipherError::InvalidHex(format!(
            "invalid hex character {}",
            ch as char
        ))),
    }
}
