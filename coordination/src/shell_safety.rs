//! Shell Safety: registry name validation
//!
//! Backend and condition names arrive from operator-controlled config files.
//! They are only ever used as keys into closed registries, but a name that
//! carries shell metacharacters is still rejected before lookup so that it
//! can be logged as an injection attempt instead of a plain typo.
//!
//! # Threat Model
//!
//! - **Config-borne injection:** `backend: "curl; rm -rf /"` must never reach
//!   a shell, an `eval`, or a format string that becomes a command line.
//! - **Lookup confusion:** names are compared byte-for-byte; no trimming of
//!   inner whitespace, no case folding, no prefix matching.

/// Shell metacharacters that can cause command injection when interpreted
/// by a shell (bash/sh/zsh).
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r', '!', '#', '~', '*', '?',
    '[', ']', '\\', '"', '\'',
];

/// Maximum accepted length for a registry name.
pub const MAX_NAME_LEN: usize = 64;

/// Why a name was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name exceeds 64 characters")]
    TooLong,
    #[error("shell metacharacter '{}' at position {position} in: {preview}", .character.escape_default())]
    Metacharacter {
        character: char,
        position: usize,
        preview: String,
    },
    #[error("character '{}' at position {position} is not allowed in a name", .character.escape_default())]
    InvalidCharacter { character: char, position: usize },
}

impl NameError {
    /// Whether the rejected input looks like a deliberate injection attempt.
    pub fn is_injection_attempt(&self) -> bool {
        matches!(self, Self::Metacharacter { .. })
    }
}

/// Validate a backend, condition, or capability name.
///
/// Accepts `[A-Za-z0-9_.-]{1,64}`. Metacharacters are reported separately
/// from other invalid characters.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    for (position, ch) in name.chars().enumerate() {
        if SHELL_METACHARACTERS.contains(&ch) {
            return Err(NameError::Metacharacter {
                character: ch,
                position,
                preview: preview(name),
            });
        }
        if !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.') {
            return Err(NameError::InvalidCharacter {
                character: ch,
                position,
            });
        }
    }
    Ok(())
}

fn preview(input: &str) -> String {
    if input.chars().count() > 100 {
        let head: String = input.chars().take(100).collect();
        format!("{head}...")
    } else {
        input.to_string()
    }
}
