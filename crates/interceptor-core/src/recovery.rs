//! Blind recovery of the client's stream position from a captured table.
//!
//! The candidate table is the client's permutation as it stood *after* it
//! enciphered the window. Rewinding it by the window length from the right
//! `(x, y)` lands on the post-key-schedule position `(0, 0)`; deciphering the
//! window from there must then yield well-formed frames.

use thiserror::Error;
use tracing::debug;

use crate::cipher::{CandidateTable, StreamCipher};
use crate::packet::{MAX_PAYLOAD_LENGTH, Packet, ParsedFrames};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("no candidate key tables supplied")]
    NoCandidates,

    #[error("recovery window is empty")]
    EmptyWindow,

    #[error("no key found: {candidates} candidate table(s) tried against a {window}-byte window")]
    NoKeyFound { candidates: usize, window: usize },
}

/// A synchronized cipher pair for the client-to-server lane.
#[derive(Debug, Clone)]
pub struct Recovered {
    /// Client stream position right after the window, `(x, y)`.
    pub offset: (u8, u8),
    /// Continues deciphering client traffic after the window.
    pub decrypt: StreamCipher,
    /// Starts at `(0, 0)`; re-enciphers everything forwarded to the server,
    /// beginning with the recovered frames.
    pub encrypt: StreamCipher,
    /// Whole frames deciphered from the window.
    pub frames: ParsedFrames,
    /// Deciphered bytes after the last whole frame (a partial frame).
    pub tail: Vec<u8>,
    pub candidate_index: usize,
}

pub fn recover(candidates: &[CandidateTable], window: &[u8]) -> Result<Recovered, RecoveryError> {
    recover_with_limit(candidates, window, MAX_PAYLOAD_LENGTH)
}

pub fn recover_with_limit(
    candidates: &[CandidateTable],
    window: &[u8],
    max_payload: usize,
) -> Result<Recovered, RecoveryError> {
    if candidates.is_empty() {
        return Err(RecoveryError::NoCandidates);
    }
    if window.is_empty() {
        return Err(RecoveryError::EmptyWindow);
    }

    let steps = window.len();
    // reverse(n) always leaves x at i - n, so only one column can reach x == 0.
    let x = (steps % 256) as u8;

    let mut scratch = StreamCipher::from_candidate(&candidates[0], 0, 0);
    let mut plain = vec![0u8; steps];

    for (candidate_index, table) in candidates.iter().enumerate() {
        for y in 0..=u8::MAX {
            scratch.restore(table, x, y);
            scratch.reverse(steps);
            if scratch.position() != (0, 0) {
                continue;
            }

            let mut trial = scratch.clone();
            plain.copy_from_slice(window);
            trial.apply(&mut plain);

            let Ok(frames) = Packet::parse_with_limit(&plain, max_payload) else {
                continue;
            };
            if frames.packets.is_empty() {
                continue;
            }

            debug!(
                "interceptor.recovery.hit candidate={} x={} y={} frames={} tail={}",
                candidate_index,
                x,
                y,
                frames.packets.len(),
                steps - frames.consumed
            );
            let tail = plain[frames.consumed..].to_vec();
            return Ok(Recovered {
                offset: (x, y),
                decrypt: trial,
                encrypt: scratch,
                frames,
                tail,
                candidate_index,
            });
        }
    }

    Err(RecoveryError::NoKeyFound {
        candidates: candidates.len(),
        window: steps,
    })
}
