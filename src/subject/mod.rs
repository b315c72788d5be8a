//! Subject registry.
//!
//! Deterministic mapping from `(service, entity, verb)` to the subjects used
//! on the wire. Publishers and consumers compute subjects independently from
//! the same inputs, so there is no shared runtime state to coordinate.
//!
//! | Stream   | Subject                                   |
//! |----------|-------------------------------------------|
//! | `cmd`    | `cmd.<service>.<Verb><Entity>`            |
//! | `events` | `events.<service>.<Entity><Verb>d`        |
//! | `dlq`    | `dlq.cmd.<service>.<Verb><Entity>`        |

use std::fmt;
use std::str::FromStr;

/// Errors produced while building or parsing subjects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("Invalid subject token {token:?}: {reason}")]
    InvalidToken { token: String, reason: &'static str },

    #[error("Subject {subject:?} does not belong to stream {stream}")]
    WrongStream { stream: &'static str, subject: String },

    #[error("Malformed command subject: {0}")]
    MalformedCommand(String),

    #[error("Unknown verb: {0}")]
    UnknownVerb(String),
}

/// The three streams every service shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    /// Commands requesting a mutation.
    Cmd,
    /// Announcements of completed mutations.
    Events,
    /// Commands that exhausted their retries.
    Dlq,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Cmd, StreamKind::Events, StreamKind::Dlq];

    /// Stream name, also the first subject token.
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Cmd => "cmd",
            StreamKind::Events => "events",
            StreamKind::Dlq => "dlq",
        }
    }

    /// Subject filter capturing every subject of this stream (`cmd.>`).
    pub fn subject_filter(&self) -> String {
        format!("{}.>", self.name())
    }

    /// Resolve the stream a subject belongs to from its first token.
    pub fn of_subject(subject: &str) -> Option<StreamKind> {
        let head = subject.split('.').next()?;
        StreamKind::ALL.into_iter().find(|k| k.name() == head)
    }

    /// Reject subjects that would not be captured by this stream.
    pub fn validate_subject(&self, subject: &str) -> Result<(), SubjectError> {
        let prefix_ok = subject
            .strip_prefix(self.name())
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1);
        if !prefix_ok {
            return Err(SubjectError::WrongStream {
                stream: self.name(),
                subject: subject.to_string(),
            });
        }
        for token in subject.split('.') {
            check_token(token)?;
        }
        Ok(())
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StreamKind {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| SubjectError::InvalidToken {
                token: s.to_string(),
                reason: "not a stream name",
            })
    }
}

/// Mutation verbs with a command and a mirrored event form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 3] = [Verb::Create, Verb::Update, Verb::Delete];

    /// Imperative form used in command subjects.
    pub fn command_form(&self) -> &'static str {
        match self {
            Verb::Create => "Create",
            Verb::Update => "Update",
            Verb::Delete => "Delete",
        }
    }

    /// Past-tense form used in event subjects.
    pub fn event_form(&self) -> &'static str {
        match self {
            Verb::Create => "Created",
            Verb::Update => "Updated",
            Verb::Delete => "Deleted",
        }
    }

    fn lowercase(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_form())
    }
}

impl FromStr for Verb {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|v| v.command_form() == s)
            .ok_or_else(|| SubjectError::UnknownVerb(s.to_string()))
    }
}

fn check_token(token: &str) -> Result<(), SubjectError> {
    let reason = if token.is_empty() {
        "empty"
    } else if token.contains(['.', '*', '>']) {
        "contains a reserved character"
    } else if token.chars().any(char::is_whitespace) {
        "contains whitespace"
    } else {
        return Ok(());
    };
    Err(SubjectError::InvalidToken {
        token: token.to_string(),
        reason,
    })
}

/// Command and event subjects for one entity of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectSet {
    service: String,
    entity: String,
}

impl SubjectSet {
    /// Build the subject set for `entity` owned by `service`.
    ///
    /// Both names must be single subject tokens.
    pub fn new(service: impl Into<String>, entity: impl Into<String>) -> Result<Self, SubjectError> {
        let service = service.into();
        let entity = entity.into();
        check_token(&service)?;
        check_token(&entity)?;
        Ok(Self { service, entity })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// `cmd.<service>.<Verb><Entity>`
    pub fn command(&self, verb: Verb) -> String {
        format!(
            "{}.{}.{}{}",
            StreamKind::Cmd.name(),
            self.service,
            verb.command_form(),
            self.entity
        )
    }

    /// `events.<service>.<Entity><Verb>d`
    pub fn event(&self, verb: Verb) -> String {
        format!(
            "{}.{}.{}{}",
            StreamKind::Events.name(),
            self.service,
            self.entity,
            verb.event_form()
        )
    }

    pub fn create(&self) -> String {
        self.command(Verb::Create)
    }

    pub fn update(&self) -> String {
        self.command(Verb::Update)
    }

    pub fn delete(&self) -> String {
        self.command(Verb::Delete)
    }

    pub fn created(&self) -> String {
        self.event(Verb::Create)
    }

    pub fn updated(&self) -> String {
        self.event(Verb::Update)
    }

    pub fn deleted(&self) -> String {
        self.event(Verb::Delete)
    }

    /// Durable consumer name shared by every replica serving `verb`.
    ///
    /// Format: `<service>-<entity>-<verb>`, lowercase.
    pub fn durable_name(&self, verb: Verb) -> String {
        format!(
            "{}-{}-{}",
            self.service.to_lowercase(),
            self.entity.to_lowercase(),
            verb.lowercase()
        )
    }

    /// Queue group name: `<durable>-workers`.
    pub fn queue_group(&self, verb: Verb) -> String {
        format!("{}-workers", self.durable_name(verb))
    }
}

/// Dead-letter subject for an original subject: `dlq.<original>`.
pub fn dlq_subject(original_subject: &str) -> String {
    format!("{}.{}", StreamKind::Dlq.name(), original_subject)
}

/// A command subject decomposed into its triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSubject {
    pub service: String,
    pub verb: Verb,
    pub entity: String,
}

impl CommandSubject {
    pub fn subject_set(&self) -> Result<SubjectSet, SubjectError> {
        SubjectSet::new(self.service.clone(), self.entity.clone())
    }
}

/// Parse `cmd.<service>.<Verb><Entity>` back into its parts.
pub fn parse_command_subject(subject: &str) -> Result<CommandSubject, SubjectError> {
    StreamKind::Cmd.validate_subject(subject)?;

    let mut tokens = subject.split('.');
    let (_, service, action) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(stream), Some(service), Some(action), None) => (stream, service, action),
        _ => return Err(SubjectError::MalformedCommand(subject.to_string())),
    };

    let (verb, entity) = Verb::ALL
        .into_iter()
        .find_map(|verb| {
            action
                .strip_prefix(verb.command_form())
                .filter(|entity| !entity.is_empty())
                .map(|entity| (verb, entity))
        })
        .ok_or_else(|| SubjectError::UnknownVerb(action.to_string()))?;

    Ok(CommandSubject {
        service: service.to_string(),
        verb,
        entity: entity.to_string(),
    })
}

/// Check whether a subject matches a filter pattern.
///
/// Matching rules:
/// - `*` matches exactly one token
/// - `>` as the last token matches one or more remaining tokens
/// - any other token must match exactly
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == ">" && pattern_tokens.peek().is_none() {
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == "*" || p == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests;
