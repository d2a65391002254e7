use thiserror::Error;

/// Top-level error type shared by every pipeline crate.
///
/// Variants are grouped by the error-kind taxonomy of the design: validation
/// errors are surfaced synchronously, refusals are structured non-errors that
/// callers branch on explicitly (see [`Refusal`]), transient errors are what
/// the ban queue retries, and fatal errors keep a component down without
/// killing the process.
#[derive(Debug, Error)]
pub enum Layer7Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient infrastructure error: {0}")]
    Transient(String),

    #[error("fatal error: {0} (remediation: {remediation})")]
    Fatal { message: String, remediation: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Layer7Result<T> = Result<T, Layer7Error>;

impl Layer7Error {
    pub fn fatal(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}

/// A structured refusal: the operation did not fail, but policy says "no".
///
/// Refusals are returned as `Ok(Refusal::X)` style values at the orchestrator
/// boundary rather than raised as errors, per the propagation policy: across
/// component boundaries results are explicit `{ok, reason, details}` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    Whitelisted { matched_rule: String },
    AlreadyBanned { existing_ban_id: i64 },
    NotBanned,
    SystemWhitelistEntry,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::Whitelisted { matched_rule } => {
                write!(f, "refused: IP is whitelisted (matched {matched_rule})")
            }
            Refusal::AlreadyBanned { existing_ban_id } => {
                write!(f, "refused: IP already banned (ban #{existing_ban_id})")
            }
            Refusal::NotBanned => write!(f, "refused: IP has no active ban"),
            Refusal::SystemWhitelistEntry => {
                write!(f, "refused: system whitelist entries cannot be removed")
            }
        }
    }
}

/// Outcome of an operation that can succeed, be refused by policy, or fail.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Refused(Refusal),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            Outcome::Refused(r) => Some(r),
            Outcome::Ok(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_display_includes_context() {
        let r = Refusal::Whitelisted {
            matched_rule: "203.0.113.0/24".into(),
        };
        assert!(r.to_string().contains("203.0.113.0/24"));
    }

    #[test]
    fn outcome_helpers() {
        let ok: Outcome<i64> = Outcome::Ok(5);
        assert!(ok.is_ok());
        assert!(ok.refusal().is_none());

        let refused: Outcome<i64> = Outcome::Refused(Refusal::NotBanned);
        assert!(!refused.is_ok());
        assert!(refused.refusal().is_some());
    }
}
