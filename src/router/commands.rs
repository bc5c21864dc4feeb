//! Slash commands posted as tracker comments.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Re-run the phase of the item's current failed or trigger status.
    Retry,
    /// Cancel every active run of the item.
    Cancel,
    /// Post a summary of the item's runs and open questions.
    Status,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Retry => "retry",
            Command::Cancel => "cancel",
            Command::Status => "status",
        }
    }
}

/// Recognise a command in the first word of a comment. Unknown commands and
/// ordinary text are `None`.
pub fn parse_command(body: &str) -> Option<Command> {
    let word = body.split_whitespace().next()?;
    let name = word.strip_prefix('/')?;
    match name.to_lowercase().as_str() {
        "retry" => Some(Command::Retry),
        "cancel" => Some(Command::Cancel),
        "status" => Some(Command::Status),
        _ => None,
    }
}
