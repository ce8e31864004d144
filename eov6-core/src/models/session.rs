use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Six ASCII digits. `\d` would also accept non-ASCII digits.
static CODE_RE: OnceLock<Regex> = OnceLock::new();

pub fn is_valid_code(code: &str) -> bool {
    CODE_RE
        .get_or_init(|| Regex::new(r"^[0-9]{6}$").expect("session code pattern"))
        .is_match(code)
}

/// Draw a 6-digit code from the OS CSPRNG.
pub fn generate_code() -> Result<String, getrandom::Error> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf)?;
    Ok(format!("{:06}", u32::from_le_bytes(buf) % 1_000_000))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Joined,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Joined => "joined",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SessionStatus::Open),
            "joined" => Ok(SessionStatus::Joined),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(format!("unknown session status {:?}", other)),
        }
    }
}

/// Why a session refused a state transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejection {
    #[error("session not found")]
    NotFound,
    #[error("session is closed")]
    Closed,
    #[error("session has expired")]
    Expired,
    #[error("caller already joined")]
    AlreadyJoined,
}

impl SessionRejection {
    /// Stable machine code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            SessionRejection::NotFound => "not_found",
            SessionRejection::Closed => "closed",
            SessionRejection::Expired => "expired",
            SessionRejection::AlreadyJoined => "already_joined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub code: String,
    pub status: SessionStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed: bool,
    pub closed_at: Option<DateTime<Utc>>,
    pub caller_joined_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub org_id: Option<String>,
    pub agent_email: Option<String>,
    pub translate_preview_count: i32,
    /// Assigned by the store on insert, independent of the explicit timestamps.
    pub inserted_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        code: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        agent_email: Option<String>,
        org_id: Option<String>,
    ) -> Self {
        Self {
            code: code.into(),
            status: SessionStatus::Open,
            created_at: Some(now),
            expires_at: Some(now + ttl),
            closed: false,
            closed_at: None,
            caller_joined_at: None,
            last_activity_at: Some(now),
            org_id,
            agent_email,
            translate_preview_count: 0,
            inserted_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.status == SessionStatus::Closed
    }

    /// Closed and expired sessions accept no further activity.
    pub fn check_active(&self, now: DateTime<Utc>) -> Result<(), SessionRejection> {
        if self.is_closed() {
            return Err(SessionRejection::Closed);
        }
        if self.is_expired(now) {
            return Err(SessionRejection::Expired);
        }
        Ok(())
    }

    /// Join preconditions, in order: not closed, not expired, not yet joined.
    pub fn check_joinable(&self, now: DateTime<Utc>) -> Result<(), SessionRejection> {
        self.check_active(now)?;
        if self.caller_joined_at.is_some() {
            return Err(SessionRejection::AlreadyJoined);
        }
        Ok(())
    }

    pub fn mark_joined(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Joined;
        self.caller_joined_at = Some(now);
        self.last_activity_at = Some(now);
    }

    pub fn mark_closed(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Closed;
        self.closed = true;
        if self.closed_at.is_none() {
            self.closed_at = Some(now);
        }
        self.last_activity_at = Some(now);
    }

    /// Whether the cleanup job would select this record.
    pub fn is_purgeable(&self, now: DateTime<Utc>, cutoffs: &StaleCutoffs) -> bool {
        if self.is_expired(now) {
            return true;
        }
        if self.is_closed() && matches!(self.closed_at, Some(c) if c <= cutoffs.closed_before) {
            return true;
        }
        match self.created_at {
            Some(created) => created <= cutoffs.created_before,
            None => self.expires_at.is_none() && self.inserted_at <= cutoffs.created_before,
        }
    }
}

/// Time thresholds separating live records from stale ones.
#[derive(Debug, Clone, Copy)]
pub struct StaleCutoffs {
    pub closed_before: DateTime<Utc>,
    pub created_before: DateTime<Utc>,
}

impl StaleCutoffs {
    pub fn new(now: DateTime<Utc>, closed_grace: Duration, max_age: Duration) -> Self {
        Self {
            closed_before: now - closed_grace,
            created_before: now - max_age,
        }
    }
}
