//! Call-out snippets: the only way the host talks back to the page.
//!
//! A call-out renders as `<namespace>.<notification>("id", "arg");` with every
//! argument passed through [`codec::quote`]. The same grammar is parsed back by
//! [`CallOut::parse`] for hosts that evaluate snippets headlessly.

use std::str::FromStr;

use thiserror::Error;

use super::CorrelationId;
use crate::codec::{self, CodecError};

/// Notification methods exposed by the script-side multiplexer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::AsRefStr,
    strum::Display,
)]
#[strum(serialize_all = "camelCase")]
pub enum Notification {
    Resolve,
    Reject,
    StreamPush,
    StreamEnd,
    StreamError,
}

impl Notification {
    pub fn arity(self) -> usize {
        match self {
            Notification::StreamEnd => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOut {
    Resolve { id: CorrelationId, value: String },
    Reject { id: CorrelationId, message: String },
    StreamPush { id: CorrelationId, chunk: String },
    StreamEnd { id: CorrelationId },
    StreamError { id: CorrelationId, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnippetError {
    #[error("snippet does not target namespace `{0}`")]
    ForeignNamespace(String),
    #[error("unknown notification `{0}`")]
    UnknownNotification(String),
    #[error("malformed snippet: {0}")]
    Malformed(&'static str),
    #[error("`{notification}` takes {expected} argument(s), got {actual}")]
    Arity {
        notification: Notification,
        expected: usize,
        actual: usize,
    },
    #[error("bad string literal: {0}")]
    Literal(#[from] CodecError),
}

impl CallOut {
    pub fn id(&self) -> &str {
        match self {
            CallOut::Resolve { id, .. }
            | CallOut::Reject { id, .. }
            | CallOut::StreamPush { id, .. }
            | CallOut::StreamEnd { id }
            | CallOut::StreamError { id, .. } => id,
        }
    }

    pub fn notification(&self) -> Notification {
        match self {
            CallOut::Resolve { .. } => Notification::Resolve,
            CallOut::Reject { .. } => Notification::Reject,
            CallOut::StreamPush { .. } => Notification::StreamPush,
            CallOut::StreamEnd { .. } => Notification::StreamEnd,
            CallOut::StreamError { .. } => Notification::StreamError,
        }
    }

    /// True for every notification that settles its id for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallOut::StreamPush { .. })
    }

    fn arguments(&self) -> Vec<&str> {
        match self {
            CallOut::Resolve { id, value } => vec![id.as_str(), value.as_str()],
            CallOut::Reject { id, message } | CallOut::StreamError { id, message } => {
                vec![id.as_str(), message.as_str()]
            }
            CallOut::StreamPush { id, chunk } => vec![id.as_str(), chunk.as_str()],
            CallOut::StreamEnd { id } => vec![id.as_str()],
        }
    }

    /// Renders the snippet. `namespace` must be a validated identifier path.
    pub fn render(&self, namespace: &str) -> String {
        let args = self
            .arguments()
            .into_iter()
            .map(codec::quote)
            .collect::<Vec<_>>()
            .join(",");
        format!("{}.{}({});", namespace, self.notification(), args)
    }

    pub fn parse(namespace: &str, snippet: &str) -> Result<Self, SnippetError> {
        let rest = snippet
            .trim()
            .strip_prefix(namespace)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| SnippetError::ForeignNamespace(namespace.to_string()))?;

        let open = rest
            .find('(')
            .ok_or(SnippetError::Malformed("missing argument list"))?;
        let method = rest[..open].trim();
        let notification = Notification::from_str(method)
            .map_err(|_| SnippetError::UnknownNotification(method.to_string()))?;

        let mut cursor = rest[open + 1..].trim_start();
        let mut args = Vec::new();
        if let Some(after) = cursor.strip_prefix(')') {
            cursor = after;
        } else {
            loop {
                let (value, after) = codec::parse_literal(cursor)?;
                args.push(value);
                let after = after.trim_start();
                if let Some(next) = after.strip_prefix(',') {
                    cursor = next.trim_start();
                } else if let Some(next) = after.strip_prefix(')') {
                    cursor = next;
                    break;
                } else {
                    return Err(SnippetError::Malformed("expected `,` or `)`"));
                }
            }
        }

        let tail = cursor.trim_start();
        if !tail.strip_prefix(';').unwrap_or(tail).trim().is_empty() {
            return Err(SnippetError::Malformed("trailing input after call"));
        }

        Self::from_parts(notification, args)
    }

    fn from_parts(notification: Notification, args: Vec<String>) -> Result<Self, SnippetError> {
        if args.len() != notification.arity() {
            return Err(SnippetError::Arity {
                notification,
                expected: notification.arity(),
                actual: args.len(),
            });
        }
        let mut args = args.into_iter();
        let id = args.next().unwrap_or_default();
        let second = args.next().unwrap_or_default();

        Ok(match notification {
            Notification::Resolve => CallOut::Resolve { id, value: second },
            Notification::Reject => CallOut::Reject {
                id,
                message: second,
            },
            Notification::StreamPush => CallOut::StreamPush { id, chunk: second },
            Notification::StreamEnd => CallOut::StreamEnd { id },
            Notification::StreamError => CallOut::StreamError {
                id,
                message: second,
            },
        })
    }
}
