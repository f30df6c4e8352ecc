use std::{
    fmt::{Display, Formatter, Result},
    time::Duration,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// What happens to a delivery once the worker is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry { delay: Duration },
    DeadLetter,
    Drop,
}

impl Disposition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Disposition::DeadLetter | Disposition::Drop)
    }
}

/// Where a failed delivery goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { delay: Duration },
    DeadLetter,
}

impl From<FailureDisposition> for Disposition {
    fn from(disposition: FailureDisposition) -> Self {
        match disposition {
            FailureDisposition::Retry { delay } => Disposition::Retry { delay },
            FailureDisposition::DeadLetter => Disposition::DeadLetter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Delivered,
    RetryScheduled,
    DeadLettered,
    Dropped,
    /// The disposition could not be published; the message was handed back to
    /// the broker for a later pass.
    Requeued,
}

/// Per-delivery report returned by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub delivery_tag: u64,
    pub disposition: Disposition,
    pub outcome: Outcome,
    pub trace_id: Option<String>,
    pub attempts: u32,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
        }
    }
}

impl Display for FailureClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl Display for Disposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Disposition::Ack => write!(f, "ack"),
            Disposition::Retry { .. } => write!(f, "retry"),
            Disposition::DeadLetter => write!(f, "dead_letter"),
            Disposition::Drop => write!(f, "drop"),
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Outcome::Delivered => write!(f, "delivered"),
            Outcome::RetryScheduled => write!(f, "retry_scheduled"),
            Outcome::DeadLettered => write!(f, "dead_lettered"),
            Outcome::Dropped => write!(f, "dropped"),
            Outcome::Requeued => write!(f, "requeued"),
        }
    }
}
