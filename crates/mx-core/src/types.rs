use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serialize an enum through serde and strip the quotes; keeps Display in
/// lockstep with the wire/database representation.
macro_rules! fmt_via_serde {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
            write!(f, "{}", s.trim_matches('"'))
        }
    };
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// Who may see an entity besides its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Public,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Public => "public",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Idle,
    Processing,
    Blocked,
    Offline,
}

/// A worker identity inside a workspace. `id` is assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub status: AgentStatus,
    pub sessions_count: i64,
    pub learnings_count: i64,
    pub tasks_completed: i64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            status: AgentStatus::Pending,
            sessions_count: 0,
            learnings_count: 0,
            tasks_completed: 0,
            created_at: now,
            last_active_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Structured context recorded alongside a session summary.
///
/// All fields are ordered lists; empty lists serialize and round-trip fine,
/// so callers can fill in whatever subset they captured.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SessionContext {
    #[serde(default)]
    pub wins: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub git_commits: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

impl SessionContext {
    pub fn is_empty(&self) -> bool {
        self.wins.is_empty()
            && self.issues.is_empty()
            && self.decisions.is_empty()
            && self.next_steps.is_empty()
            && self.challenges.is_empty()
            && self.git_commits.is_empty()
            && self.files_changed.is_empty()
    }
}

/// A recorded unit of work for a matrix.
///
/// `agent_id = None` means the session belongs to the orchestrator.
/// `previous_session_id`, when set, must reference an existing session and
/// may not introduce a cycle; the store enforces both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub summary: String,
    pub context: Option<SessionContext>,
    pub tags: Vec<String>,
    pub agent_id: Option<i64>,
    pub visibility: Visibility,
    pub project_path: Option<String>,
    pub previous_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            summary: summary.into(),
            context: None,
            tags: Vec::new(),
            agent_id: None,
            visibility: Visibility::Private,
            project_path: None,
            previous_session_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Learning — confidence and maturity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
    Proven,
}

impl Confidence {
    /// Step function mapping validation count to confidence, parallel to
    /// [`MaturityStage::for_validations`].
    pub fn for_validations(times_validated: i64) -> Self {
        match times_validated {
            n if n >= 10 => Confidence::Proven,
            n if n >= 3 => Confidence::High,
            n if n >= 1 => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaturityStage {
    #[default]
    Observation,
    Learning,
    Pattern,
    Principle,
    Wisdom,
}

impl MaturityStage {
    /// The monotone step function {0 -> observation, 1 -> learning,
    /// 3 -> pattern, 5 -> principle, 10 -> wisdom}.
    pub fn for_validations(times_validated: i64) -> Self {
        match times_validated {
            n if n >= 10 => MaturityStage::Wisdom,
            n if n >= 5 => MaturityStage::Principle,
            n if n >= 3 => MaturityStage::Pattern,
            n if n >= 1 => MaturityStage::Learning,
            _ => MaturityStage::Observation,
        }
    }
}

impl fmt::Display for MaturityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MaturityStage::Observation => "observation",
            MaturityStage::Learning => "learning",
            MaturityStage::Pattern => "pattern",
            MaturityStage::Principle => "principle",
            MaturityStage::Wisdom => "wisdom",
        };
        write!(f, "{}", label)
    }
}

/// A retained insight. Maturity and confidence are derived from
/// `times_validated` and restamped by the store on every validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: i64,
    pub category: String,
    pub title: String,
    pub description: String,
    pub what_happened: Option<String>,
    pub lesson: Option<String>,
    pub prevention: Option<String>,
    pub context: Option<String>,
    pub source_url: Option<String>,
    pub confidence: Confidence,
    pub maturity_stage: MaturityStage,
    pub times_validated: i64,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub agent_id: Option<i64>,
    pub visibility: Visibility,
    pub project_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller provides when recording a new learning; the store assigns
/// the id and stamps derived fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewLearning {
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub what_happened: Option<String>,
    #[serde(default)]
    pub lesson: Option<String>,
    #[serde(default)]
    pub prevention: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub project_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Unified tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDomain {
    System,
    Project,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric rank for ordering (higher = more urgent).
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 3,
            TaskPriority::High => 2,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GithubSyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedTaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
}

/// A cross-cutting work item, optionally mirrored to a GitHub issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedTask {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub domain: TaskDomain,
    pub priority: TaskPriority,
    pub status: UnifiedTaskStatus,
    pub github_issue_number: Option<i64>,
    pub github_issue_url: Option<String>,
    pub github_repo: Option<String>,
    pub github_sync_status: GithubSyncStatus,
    pub session_id: Option<String>,
    pub agent_id: Option<i64>,
    pub project_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedTask {
    /// System-domain tasks without an issue number stay `pending` until an
    /// external sync assigns one.
    pub fn initial_sync_status(
        domain: TaskDomain,
        issue_number: Option<i64>,
    ) -> GithubSyncStatus {
        match (domain, issue_number) {
            (TaskDomain::System, None) => GithubSyncStatus::Pending,
            (_, Some(_)) => GithubSyncStatus::Synced,
            _ => GithubSyncStatus::LocalOnly,
        }
    }
}

// ---------------------------------------------------------------------------
// Missions (agent tasks)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Running,
    Completed,
    Failed,
    Retrying,
    Blocked,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStatus::Completed | MissionStatus::Failed | MissionStatus::Cancelled
        )
    }

    /// Legal transitions of the mission state machine.
    ///
    /// - pending  -> queued | blocked | cancelled
    /// - queued   -> processing | running | blocked | cancelled
    /// - processing/running -> completed | failed | retrying | queued | cancelled
    /// - retrying -> queued | failed | cancelled
    /// - blocked  -> queued | cancelled
    /// - terminal states are immutable
    pub fn can_transition_to(&self, next: MissionStatus) -> bool {
        use MissionStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Queued, Processing)
                | (Queued, Running)
                | (Queued, Blocked)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Processing, Queued)
                | (Processing, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Queued)
                | (Running, Cancelled)
                | (Retrying, Queued)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
                | (Blocked, Queued)
                | (Blocked, Cancelled)
        )
    }
}

impl fmt::Display for MissionStatus {
    fmt_via_serde!();
}

/// Default execution timeout for a plain agent task (2 minutes).
pub const DEFAULT_TASK_TIMEOUT_MS: i64 = 120_000;
/// Default execution timeout for a mission (5 minutes).
pub const DEFAULT_MISSION_TIMEOUT_MS: i64 = 300_000;
/// Default retry budget for missions and matrix messages.
pub const DEFAULT_MAX_RETRIES: i64 = 5;

/// A unit of durable, retriable work executed by an agent.
///
/// `execution_id` is the fencing token: it is set atomically on claim and
/// only its holder may release, complete, or fail the mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub prompt: String,
    pub context: Option<String>,
    pub priority: TaskPriority,
    pub status: MissionStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub timeout_ms: i64,
    pub depends_on: Vec<String>,
    pub assigned_to: Option<i64>,
    pub execution_id: Option<String>,
    pub parent_mission_id: Option<String>,
    pub unified_task_id: Option<i64>,
    pub session_id: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            prompt: prompt.into(),
            context: None,
            priority: TaskPriority::Normal,
            status: MissionStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_MISSION_TIMEOUT_MS,
            depends_on: Vec::new(),
            assigned_to: None,
            execution_id: None,
            parent_mission_id: None,
            unified_task_id: None,
            session_id: None,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Matrix registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatrixStatus {
    Online,
    #[default]
    Offline,
    Away,
}

impl fmt::Display for MatrixStatus {
    fmt_via_serde!();
}

/// A workspace identity participating in the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub id: String,
    pub display_name: String,
    pub status: MatrixStatus,
    /// Monotone non-decreasing under `touch`.
    pub last_seen: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Matrix messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Broadcast,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl fmt::Display for MessageStatus {
    fmt_via_serde!();
}

/// A message on the outbound (or, mirrored on the peer, inbound) queue.
///
/// For a given `from_matrix`, `sequence_number` is strictly increasing in
/// enqueue order; it comes exclusively from the store's sequence counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixMessage {
    pub id: String,
    pub from_matrix: String,
    pub to_matrix: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub sequence_number: i64,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl MatrixMessage {
    pub fn message_type_for(to_matrix: &Option<String>) -> MessageType {
        if to_matrix.is_some() {
            MessageType::Direct
        } else {
            MessageType::Broadcast
        }
    }
}

// ---------------------------------------------------------------------------
// Search telemetry
// ---------------------------------------------------------------------------

/// One record per hybrid search, the data source for the weight tuner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub query_type: String,
    pub result_count: i64,
    pub latency_ms: i64,
    pub source: String,
    pub agent_id: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maturity_step_function() {
        assert_eq!(MaturityStage::for_validations(0), MaturityStage::Observation);
        assert_eq!(MaturityStage::for_validations(1), MaturityStage::Learning);
        assert_eq!(MaturityStage::for_validations(2), MaturityStage::Learning);
        assert_eq!(MaturityStage::for_validations(3), MaturityStage::Pattern);
        assert_eq!(MaturityStage::for_validations(4), MaturityStage::Pattern);
        assert_eq!(MaturityStage::for_validations(5), MaturityStage::Principle);
        assert_eq!(MaturityStage::for_validations(9), MaturityStage::Principle);
        assert_eq!(MaturityStage::for_validations(10), MaturityStage::Wisdom);
        assert_eq!(MaturityStage::for_validations(99), MaturityStage::Wisdom);
    }

    #[test]
    fn confidence_step_function() {
        assert_eq!(Confidence::for_validations(0), Confidence::Low);
        assert_eq!(Confidence::for_validations(1), Confidence::Medium);
        assert_eq!(Confidence::for_validations(3), Confidence::High);
        assert_eq!(Confidence::for_validations(10), Confidence::Proven);
    }

    #[test]
    fn mission_terminal_states_are_immutable() {
        for terminal in [
            MissionStatus::Completed,
            MissionStatus::Failed,
            MissionStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                MissionStatus::Pending,
                MissionStatus::Queued,
                MissionStatus::Processing,
                MissionStatus::Running,
                MissionStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn mission_claim_transition() {
        assert!(MissionStatus::Queued.can_transition_to(MissionStatus::Processing));
        assert!(MissionStatus::Queued.can_transition_to(MissionStatus::Running));
        assert!(!MissionStatus::Pending.can_transition_to(MissionStatus::Processing));
        assert!(MissionStatus::Processing.can_transition_to(MissionStatus::Queued));
    }

    #[test]
    fn unified_task_initial_sync_status() {
        assert_eq!(
            UnifiedTask::initial_sync_status(TaskDomain::System, None),
            GithubSyncStatus::Pending
        );
        assert_eq!(
            UnifiedTask::initial_sync_status(TaskDomain::System, Some(12)),
            GithubSyncStatus::Synced
        );
        assert_eq!(
            UnifiedTask::initial_sync_status(TaskDomain::Project, None),
            GithubSyncStatus::LocalOnly
        );
    }

    #[test]
    fn message_type_from_recipient() {
        assert_eq!(
            MatrixMessage::message_type_for(&Some("beta".into())),
            MessageType::Direct
        );
        assert_eq!(MatrixMessage::message_type_for(&None), MessageType::Broadcast);
    }

    #[test]
    fn status_display_matches_wire_format() {
        assert_eq!(MissionStatus::Processing.to_string(), "processing");
        assert_eq!(MessageStatus::Sending.to_string(), "sending");
        assert_eq!(MatrixStatus::Online.to_string(), "online");
    }

    #[test]
    fn session_context_emptiness() {
        let mut ctx = SessionContext::default();
        assert!(ctx.is_empty());
        ctx.wins.push("shipped".into());
        assert!(!ctx.is_empty());
    }
}
