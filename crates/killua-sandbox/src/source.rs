//! Normalisation of user-supplied snippets.

use crate::error::{Result, SandboxError};

/// Largest snippet accepted, in bytes.
pub const MAX_SOURCE_LEN: usize = 2000;

const FENCE: &str = "```";

/// A snippet ready to hand to a guest.
///
/// A surrounding fenced code block is removed before the size cap applies,
/// so the cap counts only the code itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCode {
    text: String,
}

impl SourceCode {
    /// Strip an optional code fence and enforce the size cap.
    pub fn parse(input: &str) -> Result<Self> {
        let text = strip_fence(input);
        if text.len() > MAX_SOURCE_LEN {
            return Err(SandboxError::TooLarge {
                len: text.len(),
                max: MAX_SOURCE_LEN,
            });
        }
        Ok(Self { text: text.to_string() })
    }

    /// The snippet text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// True for an empty snippet.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Take the text.
    pub fn into_string(self) -> String {
        self.text
    }
}

/// Remove a fenced code block wrapper.
///
/// The whole input must be one block: it starts and ends with a fence and
/// the code holds no other fence. A language tag on the opening line is
/// dropped unless nothing but whitespace follows it. Anything else is
/// returned as is.
fn strip_fence(input: &str) -> &str {
    let Some(inner) = input
        .strip_prefix(FENCE)
        .and_then(|rest| rest.strip_suffix(FENCE))
    else {
        return input;
    };

    if let Some((tag, body)) = inner.split_once('\n') {
        let is_tag = !tag.is_empty() && tag.chars().all(|c| c.is_alphanumeric() || c == '_');
        if is_tag && !body.trim().is_empty() && is_fenced_code(body, true) {
            return body;
        }
    }
    if is_fenced_code(inner, false) {
        inner
    } else {
        input
    }
}

/// Code between fences may not merge a backtick into either fence.
///
/// After a tag line the code starts on a fresh line, so a leading backtick
/// is allowed there.
fn is_fenced_code(code: &str, after_tag: bool) -> bool {
    !code.contains(FENCE) && !code.ends_with('`') && (after_tag || !code.starts_with('`'))
}
