// Domain records: accounts, reservation tasks and their audit log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub type AccountId = i64;
pub type TaskId = i64;

// Default polling interval recorded on new tasks (seconds)
pub const DEFAULT_INTERVAL_SECS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderKind {
    Ktx,
    Srt,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ktx => "KTX",
            Self::Srt => "SRT",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "KTX" => Ok(Self::Ktx),
            "SRT" => Ok(Self::Srt),
            other => Err(Error::Validation(format!("unknown provider type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub kind: ProviderKind,
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub kind: ProviderKind,
    pub username: String,
    pub secret: String,
}

// Pending -> Running -> {Pending, Success, Failed}; Stopped from either
// non-terminal state. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Pending)
                | (Running, Success)
                | (Running, Failed)
                | (Pending, Stopped)
                | (Running, Stopped)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(Error::Store(format!("unknown task status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
            Self::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Self::Info),
            "ERROR" => Ok(Self::Error),
            "SUCCESS" => Ok(Self::Success),
            other => Err(Error::Store(format!("unknown log level '{other}'"))),
        }
    }
}

// Dates and times are provider formatted (YYYYMMDD, HHMMSS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dep_station: String,
    pub arr_station: String,
    pub date: String,
    pub time_from: String,
}

/// The one train a task keeps trying to book. Never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainSelection {
    pub train_no: String,
    pub train_type: String,
    pub dep_time: String,
    pub arr_time: String,
    pub train_class: Option<String>,
    pub train_id: String,
}

impl TrainSelection {
    // A selection without a number or provider id cannot be matched or booked.
    pub fn is_complete(&self) -> bool {
        !self.train_no.trim().is_empty() && !self.train_id.trim().is_empty()
    }

    pub fn matches(&self, candidate: &TrainCandidate) -> bool {
        candidate.train_type == self.train_type && candidate.dep_time == self.dep_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub account_id: AccountId,
    pub route: Route,
    pub selection: Option<TrainSelection>,
    pub passengers: u32,
    pub interval_secs: u32,
    pub active: bool,
    pub status: TaskStatus,
    pub booked_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub account_id: AccountId,
    pub route: Route,
    pub selection: Option<TrainSelection>,
    pub passengers: u32,
    pub interval_secs: u32,
}

impl NewTask {
    pub fn new(account_id: AccountId, route: Route, selection: Option<TrainSelection>) -> Self {
        Self {
            account_id,
            route,
            selection,
            passengers: 1,
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: TaskId,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// Structured search result, as returned by a provider session or the text parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainCandidate {
    pub train_no: String,
    pub train_type: String,
    pub dep_time: String,
    pub arr_time: String,
    pub dep_station: String,
    pub arr_station: String,
    pub is_available: bool,
    pub special_seat_available: bool,
    pub general_seat_available: bool,
    pub fare: f64,
    pub run_date: String,
    pub train_id: String,
}

impl TrainCandidate {
    pub fn has_seat(&self) -> bool {
        self.is_available && (self.special_seat_available || self.general_seat_available)
    }
}

/// What a provider hands back after a confirmed reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: String,
    pub summary: String,
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Reservation ID: {})", self.summary, self.reservation_id)
    }
}
