//! Reply grammar for answers posted under question comments.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::ResponseType;

/// An answer recognised in a comment body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnswer {
    pub response_type: ResponseType,
    pub selected_option: Option<String>,
    pub custom_text: Option<String>,
}

impl ParsedAnswer {
    pub fn option(id: &str) -> Self {
        Self {
            response_type: ResponseType::OptionSelected,
            selected_option: Some(id.to_uppercase()),
            custom_text: None,
        }
    }

    pub fn approved() -> Self {
        Self {
            response_type: ResponseType::Approved,
            selected_option: None,
            custom_text: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            response_type: ResponseType::Rejected,
            selected_option: None,
            custom_text: Some(reason.to_string()),
        }
    }
}

pub const NO_REASON: &str = "No reason provided";

static OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*OPTION:\s*([A-Za-z0-9_-]+)").unwrap());
static APPROVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*APPROVE\s*$").unwrap());
static REJECT_REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bREJECT:(.*)$").unwrap());
static REJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*REJECT\s*$").unwrap());

/// Parse a reply. Precedence: `OPTION:<id>` at the start of a line,
/// `APPROVE`, `REJECT:<reason>`, bare `REJECT`. Anything else is not an
/// answer.
pub fn parse_reply(body: &str) -> Option<ParsedAnswer> {
    if let Some(caps) = OPTION_RE.captures(body) {
        return Some(ParsedAnswer::option(&caps[1]));
    }
    if APPROVE_RE.is_match(body) {
        return Some(ParsedAnswer::approved());
    }
    if let Some(caps) = REJECT_REASON_RE.captures(body) {
        let reason = caps[1].trim();
        return Some(ParsedAnswer::rejected(if reason.is_empty() {
            NO_REASON
        } else {
            reason
        }));
    }
    if REJECT_RE.is_match(body) {
        return Some(ParsedAnswer::rejected(NO_REASON));
    }
    None
}
