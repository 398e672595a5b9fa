pub type BuildID = i32;

/// Terminal (and in-flight) states shared by build rows and build step rows.
/// The numeric values are part of the queue schema; do not renumber.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success = 0,
    Failed = 1,
    DepFailed = 2, // builds only
    Aborted = 3,
    Cancelled = 4,
    FailedWithOutput = 6,
    TimedOut = 7,
    CachedFailure = 8, // steps only
    Unsupported = 9,
    LogLimitExceeded = 10,
    Busy = 100, // not stored
}

impl BuildStatus {
    #[must_use]
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::Failed),
            2 => Some(Self::DepFailed),
            3 => Some(Self::Aborted),
            4 => Some(Self::Cancelled),
            6 => Some(Self::FailedWithOutput),
            7 => Some(Self::TimedOut),
            8 => Some(Self::CachedFailure),
            9 => Some(Self::Unsupported),
            10 => Some(Self::LogLimitExceeded),
            100 => Some(Self::Busy),
            _ => None,
        }
    }
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Build = 0,
    Substitution = 1,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Build {
    pub id: BuildID,
    pub jobset_id: i32,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub recipe_path: String,
    pub max_silent: Option<i32>,
    pub timeout: Option<i32>,
    pub timestamp: i64,
    pub global_priority: i32,
    pub priority: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct BuildSmall {
    pub id: BuildID,
    pub global_priority: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Jobset {
    pub project: String,
    pub name: String,
    pub scheduling_shares: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct StepTiming {
    pub start_time: Option<i32>,
    pub stop_time: Option<i32>,
}

pub struct CreateBuildStep<'a> {
    pub start_time: Option<i32>,
    pub build_id: BuildID,
    pub recipe_path: &'a str,
    pub platform: Option<&'a str>,
    pub machine: &'a str,
    pub status: BuildStatus,
    pub error_msg: Option<&'a str>,
    pub propagated_from: Option<BuildID>,
    pub outputs: Vec<(String, Option<String>)>,
}

pub struct FinishBuildStep<'a> {
    pub build_id: BuildID,
    pub step_nr: i32,
    pub status: BuildStatus,
    pub error_msg: Option<&'a str>,
    pub start_time: i32,
    pub stop_time: i32,
    pub machine: Option<&'a str>,
}

pub struct MarkBuildSucceeded {
    pub id: BuildID,
    pub start_time: i32,
    pub stop_time: i32,
    pub size: i64,
    pub is_cached: bool,
    pub outputs: Vec<(String, String)>,
}
