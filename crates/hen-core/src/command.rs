use crate::status::Status;

/// One inbound line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    List,
    Help,
    SetStatus(Status),
    /// Raw line; recipients are extracted by [`parse_direct_message`].
    DirectMessage(String),
    Chat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    /// In order of `@` occurrence, duplicates kept.
    pub recipients: Vec<String>,
    pub text: String,
}

impl DirectMessage {
    pub fn is_addressed_to(&self, nick: &str) -> bool {
        self.recipients.iter().any(|r| r == nick)
    }
}

/// Classifies a line with its line terminator already removed.
///
/// Keyword prefixes are case-sensitive and checked in a fixed order: `DM`,
/// `LIST`, `HELP`, then the status literals. A blank line or `quit` in any
/// case ends the session; everything else is chat.
pub fn classify(line: &str) -> Command {
    if line.starts_with("DM") {
        return Command::DirectMessage(line.to_string());
    }
    if line.starts_with("LIST") {
        return Command::List;
    }
    if line.starts_with("HELP") {
        return Command::Help;
    }
    if let Some(status) = Status::from_prefix(line) {
        return Command::SetStatus(status);
    }
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("quit") {
        return Command::Quit;
    }
    Command::Chat(line.to_string())
}

/// Extracts `@nick` targets and the trailing text from a DM line.
///
/// Every `@` starts a recipient token that runs to the next space or the end
/// of the line. The text is whatever follows the last token and its
/// delimiter. Returns `None` when there is no `@` or a token is empty.
pub fn parse_direct_message(line: &str) -> Option<DirectMessage> {
    let mut recipients = Vec::new();
    let mut text_start = None;
    for (at, _) in line.match_indices('@') {
        let start = at + 1;
        let end = line[start..]
            .find(' ')
            .map_or(line.len(), |offset| start + offset);
        let token = line[start..end].trim();
        if token.is_empty() {
            return None;
        }
        recipients.push(token.to_string());
        text_start = Some((end + 1).min(line.len()));
    }
    let text_start = text_start?;
    Some(DirectMessage {
        recipients,
        text: line[text_start..].to_string(),
    })
}
