//! Tail recovery: locating the valid end of a file after reopen.
//!
//! The writer terminates the valid region with an 8-byte little-endian
//! sentinel: [`TAIL_MAGIC`] while the file is open for appends, or
//! [`EOF_MAGIC`] once it is finished. Recovery scans backwards from the
//! physical end of the file for the last non-zero byte and checks the
//! word ending there against the sentinels.

use crate::error::AofError;

/// Sentinel word stored at the writable tail of an open file.
pub const TAIL_MAGIC: u64 = 0x419b_9c63_5475_2524;

/// Sentinel word that replaces the tail marker when a file is finished.
pub const EOF_MAGIC: u64 = 0xf878_aca5_f21f_db2c;

/// What recovery found at the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// The file has no data at all.
    Empty,
    /// A tail marker was found; the file is open for further appends.
    Tail,
    /// An EOF marker was found; the file is finished and read-only.
    Eof,
    /// Non-zero data with no recognisable marker.
    Corrupted,
}

/// A recovered tail offset plus its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Byte offset of the valid tail (data lives in `[0, tail)`).
    pub tail: u64,
    /// How the tail was located.
    pub kind: RecoveryKind,
}

/// A recovery strategy: given the mapped prefix `[0, file_size)`,
/// locate the tail.
pub type RecoveryFn = fn(&[u8]) -> RecoveryOutcome;

/// How to recover a file on open.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryOptions {
    /// Use the magic-word strategy (the default). When `false`, the
    /// first-non-zero strategy is used and no sentinel is ever written.
    pub magic: bool,
    /// Expect the file to be finished; open it read-only and fail if
    /// it does not exist.
    pub eof: bool,
    /// Override the strategy entirely.
    pub func: Option<RecoveryFn>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            magic: true,
            eof: false,
            func: None,
        }
    }
}

impl RecoveryOptions {
    /// The strategy implied by these options.
    #[must_use]
    pub fn resolve(&self) -> RecoveryFn {
        match self.func {
            Some(f) => f,
            None if self.magic => recover_with_magic,
            None => recover_first_non_zero,
        }
    }

    /// Validates the requested outcome against what recovery found.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Corrupted`] for a corrupted scan, and
    /// [`AofError::EmptyFile`] when EOF recovery found no EOF marker.
    pub fn check(&self, outcome: RecoveryOutcome) -> Result<RecoveryOutcome, AofError> {
        match outcome.kind {
            RecoveryKind::Corrupted => Err(AofError::Corrupted),
            RecoveryKind::Eof | RecoveryKind::Tail | RecoveryKind::Empty if !self.eof => {
                Ok(outcome)
            }
            RecoveryKind::Eof => Ok(outcome),
            // EOF was demanded but the file never saw finish().
            RecoveryKind::Tail | RecoveryKind::Empty => Err(AofError::EmptyFile),
        }
    }
}

/// Scans backwards in 8-byte strides for the last non-zero byte and
/// matches the word ending there against [`TAIL_MAGIC`] /
/// [`EOF_MAGIC`].
///
/// Both sentinels have a non-zero most significant byte, so on a
/// well-formed file the last non-zero byte is always the final byte of
/// the sentinel. This holds at any alignment (appends are not padded).
#[must_use]
pub fn recover_with_magic(data: &[u8]) -> RecoveryOutcome {
    let Some(last) = last_non_zero(data) else {
        return RecoveryOutcome {
            tail: 0,
            kind: RecoveryKind::Empty,
        };
    };
    let end = last + 1;
    if end < 8 {
        return RecoveryOutcome {
            tail: 0,
            kind: RecoveryKind::Corrupted,
        };
    }
    let word_start = end - 8;
    let mut word = [0u8; 8];
    word.copy_from_slice(&data[word_start..end]);
    let kind = match u64::from_le_bytes(word) {
        TAIL_MAGIC => RecoveryKind::Tail,
        EOF_MAGIC => RecoveryKind::Eof,
        _ => RecoveryKind::Corrupted,
    };
    RecoveryOutcome {
        tail: word_start as u64,
        kind,
    }
}

/// Magic-free recovery: the tail is one past the last non-zero byte.
#[must_use]
pub fn recover_first_non_zero(data: &[u8]) -> RecoveryOutcome {
    match last_non_zero(data) {
        Some(last) => RecoveryOutcome {
            tail: last as u64 + 1,
            kind: RecoveryKind::Tail,
        },
        None => RecoveryOutcome {
            tail: 0,
            kind: RecoveryKind::Empty,
        },
    }
}

/// Index of the last non-zero byte, scanning backwards in 8-byte
/// strides.
fn last_non_zero(data: &[u8]) -> Option<usize> {
    let mut end = data.len();
    while end > 0 {
        let begin = end.saturating_sub(8);
        let chunk = &data[begin..end];
        if chunk.iter().any(|&b| b != 0) {
            for i in (begin..end).rev() {
                if data[i] != 0 {
                    return Some(i);
                }
            }
        }
        end = begin;
    }
    None
}
