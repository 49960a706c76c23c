//! Input sanitizer: a closed deny-list of dangerous literal patterns.
//!
//! A match is a hard rejection. Inputs are never escaped or rewritten.
//! Commands that genuinely need pipes or chaining have to be built by a
//! capability template, not passed in raw.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::error::GateError;
use crate::invocation::Arguments;

/// A deny-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    CommandChaining,
    Substitution,
    Backtick,
    PathTraversal,
    AppendAbsolute,
    RedirectAbsolute,
    EvalExec,
    NullByte,
    LineBreak,
}

impl Pattern {
    pub const ALL: [Pattern; 9] = [
        Pattern::CommandChaining,
        Pattern::Substitution,
        Pattern::Backtick,
        Pattern::PathTraversal,
        Pattern::AppendAbsolute,
        Pattern::RedirectAbsolute,
        Pattern::EvalExec,
        Pattern::NullByte,
        Pattern::LineBreak,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CommandChaining => "command_chaining",
            Self::Substitution => "substitution",
            Self::Backtick => "backtick",
            Self::PathTraversal => "path_traversal",
            Self::AppendAbsolute => "append_absolute",
            Self::RedirectAbsolute => "redirect_absolute",
            Self::EvalExec => "eval_exec",
            Self::NullByte => "null_byte",
            Self::LineBreak => "line_break",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::CommandChaining => "command chaining characters (;, &, |)",
            Self::Substitution => "command/variable substitution ($( or ${)",
            Self::Backtick => "backtick substitution",
            Self::PathTraversal => "path traversal (..)",
            Self::AppendAbsolute => "append to absolute path (>> /)",
            Self::RedirectAbsolute => "redirect to absolute path (> /)",
            Self::EvalExec => "eval/exec keyword",
            Self::NullByte => "embedded null byte",
            Self::LineBreak => "embedded newline or carriage return",
        }
    }

    fn regex(self) -> &'static Regex {
        &DENY_LIST[self as usize]
    }
}

// Same order as `Pattern` discriminants.
static DENY_LIST: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"[;&|]",
        r"\$[\(\{]",
        r"`",
        r"\.\.",
        r">>\s*/",
        r">\s*/",
        r"\b(eval|exec)\b",
        r"\x00",
        r"[\n\r]",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid deny-list pattern {p}: {e}")))
    .collect()
});

/// Returns the first deny-list pattern found in `value`, if any.
pub fn find_pattern(value: &str) -> Option<Pattern> {
    Pattern::ALL.into_iter().find(|p| p.regex().is_match(value))
}

/// Checks every string-typed argument independently.
///
/// Pure and total: the same arguments always produce the same verdict, and
/// nothing is modified.
pub fn check(arguments: &Arguments) -> Result<(), GateError> {
    for (field, value) in arguments {
        let Some(text) = value.as_str() else {
            continue;
        };
        if let Some(pattern) = find_pattern(text) {
            warn!(
                "Sanitizer rejected argument '{field}': {}",
                pattern.description()
            );
            return Err(GateError::SanitizationRejected {
                field: field.clone(),
                pattern,
            });
        }
    }
    Ok(())
}
