//! Repair-hint selection for structured-output parse failures.
//!
//! After the second parse failure in a row the retry loop switches to repair
//! mode and asks the caller to append one of three targeted correction
//! hints to the next attempt's instructions. The selection keys off the
//! parse error text; the three-way taxonomy is the contract, the matching
//! strings are heuristic.

/// Which way the structured output went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    /// Output stopped mid-structure (length limit, stream cut).
    Truncated,
    /// Structurally complete but syntactically invalid JSON.
    MalformedSyntax,
    /// Anything else.
    Generic,
}

const TRUNCATION_MARKERS: &[&str] = &["truncat", "unexpected end", "eof while parsing"];

const SYNTAX_MARKERS: &[&str] = &[
    "unexpected token",
    "invalid json",
    "malformed",
    "expected value",
    "trailing characters",
];

/// Pick the repair kind for a parse error message.
pub fn repair_kind_for(message: &str) -> RepairKind {
    let lower = message.to_lowercase();
    if TRUNCATION_MARKERS.iter().any(|m| lower.contains(m)) {
        RepairKind::Truncated
    } else if SYNTAX_MARKERS.iter().any(|m| lower.contains(m)) {
        RepairKind::MalformedSyntax
    } else {
        RepairKind::Generic
    }
}

/// The correction instruction injected into the next attempt's prompt.
pub fn repair_hint(kind: RepairKind) -> &'static str {
    match kind {
        RepairKind::Truncated => {
            "Your previous response was cut off before the JSON was complete. \
             Respond with the complete JSON document only, and keep it compact \
             so it fits in the response limit."
        }
        RepairKind::MalformedSyntax => {
            "Your previous response was not valid JSON (check quoting, commas \
             and brackets). Respond with only a single valid JSON document: no \
             markdown fences, no commentary before or after."
        }
        RepairKind::Generic => {
            "Your previous response could not be parsed as the requested JSON. \
             Respond with only a single valid JSON document matching the \
             requested structure."
        }
    }
}

/// Convenience: kind selection plus hint text in one step.
pub fn repair_hint_for(message: &str) -> (RepairKind, &'static str) {
    let kind = repair_kind_for(message);
    (kind, repair_hint(kind))
}
