use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a single task.
///
/// `NotStarted -> Pending` on dispatch notification, `Pending -> Running`
/// when the backend confirms execution start, `Running -> Succeeded|Failed`
/// on completion. Any state may be forced to `Failed` when the backend
/// loses a task without a normal status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_started" => Some(Self::NotStarted),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    /// A forced `Failed` is always legal.
    pub fn can_transition(&self, next: TaskStatus) -> bool {
        if next == Self::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Self::NotStarted, Self::Pending)
                | (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

/// The closed set of execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Local,
    Lsf,
    Celery,
    Windows,
}

impl RunnerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "lsf" => Some(Self::Lsf),
            "celery" => Some(Self::Celery),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Lsf => "lsf",
            Self::Celery => "celery",
            Self::Windows => "windows",
        }
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

/// What to do when a task's output directory already holds a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ExistingPolicy {
    Run,
    Skip,
    Sync,
}

impl ExistingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "run" => Some(Self::Run),
            "skip" => Some(Self::Skip),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Skip => "skip",
            Self::Sync => "sync",
        }
    }
}

/// What to do when a task's output directory belongs to a still-pending run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum PendingPolicy {
    Run,
    Skip,
    Sync,
    Wait,
}

impl PendingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "run" => Some(Self::Run),
            "skip" => Some(Self::Skip),
            "sync" => Some(Self::Sync),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Skip => "skip",
            Self::Sync => "sync",
            Self::Wait => "wait",
        }
    }
}

/// One configuration layer: either a named label or an inline override map.
/// Order across layers is significant, last wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigLayer {
    Label(String),
    Object(Map<String, Value>),
}

impl ConfigLayer {
    pub fn as_label(&self) -> Option<&str> {
        match self {
            Self::Label(s) => Some(s),
            Self::Object(_) => None,
        }
    }

    /// Parses the legacy colon-joined wire format, e.g. `base:low-light:{"gain":2}`.
    /// JSON object segments may themselves contain colons; the split tracks
    /// brace depth and string quoting. Parse-only compatibility, never the
    /// in-memory representation.
    pub fn parse_legacy(joined: &str) -> Vec<ConfigLayer> {
        let mut layers = Vec::new();
        let mut segment = String::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for c in joined.chars() {
            if escaped {
                escaped = false;
                segment.push(c);
                continue;
            }
            match c {
                '\\' if in_string => {
                    escaped = true;
                    segment.push(c);
                }
                '"' => {
                    in_string = !in_string;
                    segment.push(c);
                }
                '{' if !in_string => {
                    depth += 1;
                    segment.push(c);
                }
                '}' if !in_string => {
                    depth = depth.saturating_sub(1);
                    segment.push(c);
                }
                ':' if depth == 0 && !in_string => {
                    push_legacy_segment(&mut layers, &segment);
                    segment.clear();
                }
                _ => segment.push(c),
            }
        }
        push_legacy_segment(&mut layers, &segment);
        layers
    }
}

fn push_legacy_segment(layers: &mut Vec<ConfigLayer>, segment: &str) {
    let segment = segment.trim();
    if segment.is_empty() {
        return;
    }
    if segment.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(segment) {
            layers.push(ConfigLayer::Object(map));
            return;
        }
    }
    layers.push(ConfigLayer::Label(segment.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_roundtrip() {
        for s in ["not_started", "pending", "running", "succeeded", "failed"] {
            assert_eq!(TaskStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::parse("paused").is_none());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::NotStarted.can_transition(TaskStatus::Pending));
        assert!(TaskStatus::Pending.can_transition(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition(TaskStatus::Succeeded));
        assert!(!TaskStatus::NotStarted.can_transition(TaskStatus::Running));
        assert!(!TaskStatus::Succeeded.can_transition(TaskStatus::Running));
        // Forced failure is legal from any state.
        assert!(TaskStatus::Pending.can_transition(TaskStatus::Failed));
        assert!(TaskStatus::Succeeded.can_transition(TaskStatus::Failed));
    }

    #[test]
    fn test_runner_kind_parse() {
        assert_eq!(RunnerKind::parse("LSF"), Some(RunnerKind::Lsf));
        assert_eq!(RunnerKind::parse("windows"), Some(RunnerKind::Windows));
        assert!(RunnerKind::parse("slurm").is_none());
    }

    #[test]
    fn test_config_layer_json_array() {
        let layers: Vec<ConfigLayer> =
            serde_json::from_value(json!(["base", {"gain": 2}])).unwrap();
        assert_eq!(layers[0], ConfigLayer::Label("base".into()));
        assert!(matches!(layers[1], ConfigLayer::Object(_)));
    }

    #[test]
    fn test_parse_legacy_colon_format() {
        let layers = ConfigLayer::parse_legacy(r#"base:low-light:{"gain":2,"mode":"a:b"}"#);
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].as_label(), Some("base"));
        assert_eq!(layers[1].as_label(), Some("low-light"));
        match &layers[2] {
            ConfigLayer::Object(map) => {
                assert_eq!(map["gain"], json!(2));
                assert_eq!(map["mode"], json!("a:b"));
            }
            other => panic!("expected object layer, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_legacy_empty_segments() {
        let layers = ConfigLayer::parse_legacy("base::");
        assert_eq!(layers.len(), 1);
    }
}
