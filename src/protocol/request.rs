//! The closed set of call-in entry points and the requests they carry.
//!
//! Wire names such as `llm.stream` only exist at the channel boundary; past
//! [`EntryPoint::from_str`] everything is matched on tagged variants.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{envelope::TransportError, CorrelationId};

pub const BUDGET_FIELD: &str = "maxTokens";

/// A capability family: one engine lifecycle and one resource directory each.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Text generation.
    Llm,
    /// Speech synthesis.
    Tts,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Llm, Family::Tts];

    /// Name of the request field holding the generation input.
    pub fn input_field(self) -> &'static str {
        match self {
            Family::Llm => "prompt",
            Family::Tts => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Complete,
    Stream,
    Load,
    Unload,
    List,
    Status,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Complete,
        Operation::Stream,
        Operation::Load,
        Operation::Unload,
        Operation::List,
        Operation::Status,
    ];
}

const CANCEL_ENTRY: &str = "bridge.cancel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Capability(Family, Operation),
    Cancel,
}

impl EntryPoint {
    pub fn family(&self) -> Option<Family> {
        match self {
            EntryPoint::Capability(family, _) => Some(*family),
            EntryPoint::Cancel => None,
        }
    }

    /// Streaming entry points answer with push/end/error instead of resolve/reject.
    pub fn is_streaming(&self) -> bool {
        matches!(self, EntryPoint::Capability(_, Operation::Stream))
    }

    /// Every entry point a host with the given families binds.
    pub fn bound_for(families: impl IntoIterator<Item = Family>) -> Vec<EntryPoint> {
        let mut entries: Vec<EntryPoint> = families
            .into_iter()
            .flat_map(|family| {
                Operation::ALL
                    .into_iter()
                    .map(move |op| EntryPoint::Capability(family, op))
            })
            .collect();
        entries.push(EntryPoint::Cancel);
        entries
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Capability(family, op) => write!(f, "{}.{}", family, op),
            EntryPoint::Cancel => f.write_str(CANCEL_ENTRY),
        }
    }
}

impl FromStr for EntryPoint {
    type Err = TransportError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name == CANCEL_ENTRY {
            return Ok(EntryPoint::Cancel);
        }
        let unknown = || TransportError::UnknownEntryPoint(name.to_string());
        let (family, op) = name.split_once('.').ok_or_else(unknown)?;
        let family = Family::from_str(family).map_err(|_| unknown())?;
        let op = Operation::from_str(op).map_err(|_| unknown())?;
        Ok(EntryPoint::Capability(family, op))
    }
}

/// Token budget bounds applied while validating generation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPolicy {
    pub default: u32,
    pub max: u32,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            default: 256,
            max: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Complete {
        family: Family,
        input: String,
        budget: u32,
    },
    Stream {
        family: Family,
        input: String,
        budget: u32,
    },
    Load {
        family: Family,
        name: String,
    },
    Unload {
        family: Family,
    },
    List {
        family: Family,
    },
    Status {
        family: Family,
    },
    Cancel {
        target: CorrelationId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{0}` must not be empty")]
    Empty(&'static str),
    #[error("`maxTokens` of {requested} exceeds the limit of {limit}")]
    BudgetTooLarge { requested: u64, limit: u32 },
}

impl Request {
    /// Validates `body` for `entry`.
    ///
    /// Checks run in a fixed order: presence of every required field, then
    /// field types, then value rules.
    pub fn parse(
        entry: EntryPoint,
        body: &Map<String, Value>,
        budget: BudgetPolicy,
    ) -> Result<Self, ValidationError> {
        let required: Vec<&'static str> = match entry {
            EntryPoint::Capability(family, Operation::Complete | Operation::Stream) => {
                vec![family.input_field()]
            }
            EntryPoint::Capability(_, Operation::Load) => vec!["name"],
            EntryPoint::Capability(_, _) => vec![],
            EntryPoint::Cancel => vec!["target"],
        };
        if let Some(missing) = required.iter().find(|field| !body.contains_key(**field)) {
            return Err(ValidationError::MissingField(*missing));
        }

        let request = match entry {
            EntryPoint::Capability(family, op @ (Operation::Complete | Operation::Stream)) => {
                let input = string_field(body, family.input_field())?;
                let budget = budget_field(body, budget)?;
                if op == Operation::Stream {
                    Request::Stream {
                        family,
                        input,
                        budget,
                    }
                } else {
                    Request::Complete {
                        family,
                        input,
                        budget,
                    }
                }
            }
            EntryPoint::Capability(family, Operation::Load) => {
                let name = string_field(body, "name")?;
                if name.trim().is_empty() {
                    return Err(ValidationError::Empty("name"));
                }
                Request::Load { family, name }
            }
            EntryPoint::Capability(family, Operation::Unload) => Request::Unload { family },
            EntryPoint::Capability(family, Operation::List) => Request::List { family },
            EntryPoint::Capability(family, Operation::Status) => Request::Status { family },
            EntryPoint::Cancel => {
                let target = string_field(body, "target")?;
                if target.is_empty() {
                    return Err(ValidationError::Empty("target"));
                }
                Request::Cancel { target }
            }
        };
        Ok(request)
    }

    pub fn family(&self) -> Option<Family> {
        match self {
            Request::Complete { family, .. }
            | Request::Stream { family, .. }
            | Request::Load { family, .. }
            | Request::Unload { family }
            | Request::List { family }
            | Request::Status { family } => Some(*family),
            Request::Cancel { .. } => None,
        }
    }
}

fn string_field(body: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match body.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ValidationError::InvalidType {
            field,
            expected: "a string",
        }),
        None => Err(ValidationError::MissingField(field)),
    }
}

fn budget_field(body: &Map<String, Value>, policy: BudgetPolicy) -> Result<u32, ValidationError> {
    let requested = match body.get(BUDGET_FIELD) {
        None | Some(Value::Null) => return Ok(policy.default),
        Some(value) => value.as_u64().ok_or(ValidationError::InvalidType {
            field: BUDGET_FIELD,
            expected: "a non-negative integer",
        })?,
    };
    if requested > u64::from(policy.max) {
        return Err(ValidationError::BudgetTooLarge {
            requested,
            limit: policy.max,
        });
    }
    // Bounded by `policy.max` above.
    Ok(requested as u32)
}
