//! Core data types shared across the dispatch substrate (§3).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which family of crash artifact is being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Anr,
    Tombstone,
}

impl std::str::FromStr for LogKind {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anr" => Ok(LogKind::Anr),
            "tombstone" => Ok(LogKind::Tombstone),
            other => Err(crate::error::DispatchError::InvalidKind(other.to_string())),
        }
    }
}

/// Thoroughness-vs-cost tuning knob (§3, §4.2, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Quick,
    Intelligent,
    LargeFile,
    MaxToken,
}

impl std::str::FromStr for Mode {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "quick" => Ok(Mode::Quick),
            "intelligent" => Ok(Mode::Intelligent),
            "largefile" => Ok(Mode::LargeFile),
            "maxtoken" => Ok(Mode::MaxToken),
            other => Err(crate::error::DispatchError::InvalidMode(other.to_string())),
        }
    }
}

impl Mode {
    /// Output/input token ratio used by the cost calculator (§4.2).
    pub fn output_ratio(self) -> f64 {
        match self {
            Mode::Quick => 0.2,
            Mode::Intelligent => 0.4,
            Mode::LargeFile => 0.5,
            Mode::MaxToken => 0.8,
        }
    }

    /// Fraction of the context window usable per chunk (§4.2, §4.4).
    pub fn context_ratio(self) -> f64 {
        match self {
            Mode::Quick => 0.9,
            Mode::Intelligent => 0.7,
            Mode::LargeFile => 0.6,
            Mode::MaxToken => 0.5,
        }
    }

    /// Per-mode cap on ANR thread blocks packed into one chunk (§4.4). `None` = unlimited.
    pub fn thread_cap(self) -> Option<usize> {
        match self {
            Mode::Quick => Some(20),
            Mode::Intelligent => Some(50),
            Mode::LargeFile => Some(100),
            Mode::MaxToken => None,
        }
    }
}

/// A request to analyze a crash artifact. Immutable once submitted (§3).
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub content: Vec<u8>,
    pub log_kind: LogKind,
    pub mode: Mode,
    pub provider_hint: Option<String>,
    pub use_cache: bool,
    pub priority: i32,
    pub client_id: String,
}

impl AnalysisRequest {
    pub fn new(content: impl Into<Vec<u8>>, log_kind: LogKind, mode: Mode) -> Self {
        Self {
            content: content.into(),
            log_kind,
            mode,
            provider_hint: None,
            use_cache: true,
            priority: 5,
            client_id: "default".to_string(),
        }
    }
}

/// Per-model pricing and context limits, part of a provider's `ModelCatalog` (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelSpec {
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub context_window: u64,
    pub max_output_tokens: u64,
    /// Relative generation speed, 1 (slowest) .. 5 (fastest) — used by `recommend` (§4.2).
    pub speed_rating: u8,
    /// Relative output quality, 1 (lowest) .. 5 (highest) — used by `recommend` (§4.2).
    pub quality_rating: u8,
}

/// `model-id -> ModelSpec` for one provider.
pub type ModelCatalog = HashMap<String, ModelSpec>;

/// `Mode -> default model-id` for one provider. Invariant: every value resolves in the
/// provider's `ModelCatalog` (§3); enforced by `DispatchConfig::validate`.
pub type ModeMap = HashMap<Mode, String>;

/// 256-bit digest of raw request content (§3). Used only to derive cache keys; never
/// surfaced on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFingerprint(pub [u8; 32]);

impl ContentFingerprint {
    pub fn of(content: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(content);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        ContentFingerprint(bytes)
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// A contiguous slice of input sized for one upstream round-trip (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub text: String,
    pub est_input_tokens: u64,
}

/// Coarse structural metadata extracted from a log for status messages only (SPEC_FULL §11);
/// never used for chunk boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuralSummary {
    pub total_threads: Option<usize>,
    pub total_sections: Option<usize>,
    pub main_thread_state: Option<String>,
    pub crash_signal: Option<String>,
}

/// Lifecycle state of a queued or running analysis (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One entry in the Task Queue (§3, §4.7).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub request: AnalysisRequest,
    pub status: TaskStatus,
    pub priority: i32,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub token_id: Option<Uuid>,
}

impl Task {
    pub fn new(request: AnalysisRequest) -> Self {
        let priority = request.priority;
        Self {
            id: Uuid::new_v4(),
            request,
            status: TaskStatus::Pending,
            priority,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            token_id: None,
        }
    }
}

/// Snapshot of dispatch progress (§3, §4.6). `current_chunk <= total_chunks` always.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressState {
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub processed_tokens: u64,
    pub estimated_total_tokens: u64,
    #[serde(skip, default = "SystemTime::now")]
    pub started_at: SystemTime,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            current_chunk: 0,
            total_chunks: 0,
            processed_tokens: 0,
            estimated_total_tokens: 0,
            started_at: SystemTime::now(),
        }
    }
}

impl ProgressState {
    /// `current_chunk / total_chunks * 100`, or 0 when there's nothing to divide by (§4.6).
    pub fn percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            0.0
        } else {
            (self.current_chunk as f64 / self.total_chunks as f64) * 100.0
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }

    /// `elapsed * (total - current) / current`, or `None` before the first chunk completes (§4.6).
    pub fn estimated_remaining(&self) -> Option<Duration> {
        if self.current_chunk == 0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        let rate = self.current_chunk as f64 / elapsed.max(f64::EPSILON);
        let remaining_chunks = (self.total_chunks.saturating_sub(self.current_chunk)) as f64;
        if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining_chunks / rate))
        } else {
            None
        }
    }
}

/// Monotonically non-decreasing usage tally for the lifetime of one dispatch (§3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub errors: u64,
    pub cancellations: u64,
}

impl UsageCounters {
    pub fn add_request(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.requests += 1;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.cost_usd += cost_usd;
    }

    pub fn add_error(&mut self) {
        self.errors += 1;
    }

    pub fn add_cancellation(&mut self) {
        self.cancellations += 1;
    }
}

/// One row per analysis attempt (§3, §6). Write-once at creation; status/result fields
/// are update-once each thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub analysis_id: Uuid,
    pub kind: LogKind,
    pub mode: Mode,
    pub provider: String,
    pub model: String,
    pub content_hash: String,
    pub content_size: u64,
    pub status: TaskStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub error: Option<String>,
}
