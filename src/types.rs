use serde::{Deserialize, Serialize};

/// Outcome of one external tool run within a scan job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub ok: bool,
    /// Raw capture written by this tool.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
}

impl ToolOutcome {
    pub fn failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            path: path.into(),
            exit_code: None,
            error: Some(error.into()),
            truncated: false,
            timed_out: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcomes {
    pub nmap: ToolOutcome,
    pub dig: ToolOutcome,
    pub whois: ToolOutcome,
}

/// Summary written as `summary.json` next to the raw captures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ip: String,
    pub timestamp: String,
    pub tools: ToolOutcomes,
    pub open_ports: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}
