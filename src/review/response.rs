//! Response schemas for reviewer, strategist and oracle output.
//!
//! Model output is free text; the JSON payload is located with
//! [`crate::util::extract_json`] and must then deserialize into these types.
//! Missing required fields or an unknown decision is a parse failure.

use serde::{Deserialize, Serialize};

use crate::errors::CollaboratorError;
use crate::state::{EscalationDecision, Resolution};
use crate::util::extract_json;

const REVIEWER: &str = "reviewer";
const STRATEGIST: &str = "strategist";
const ORACLE: &str = "oracle";

/// Reviewer verdict for one diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub approved: bool,
    /// Problems that must be fixed before merging
    #[serde(default)]
    pub issues: Vec<String>,
    /// Optional improvements; never block a merge
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ReviewResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn reject(issues: Vec<String>) -> Self {
        Self {
            approved: false,
            issues,
            suggestions: Vec::new(),
        }
    }
}

/// Decision-specific details from the strategist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategistAction {
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub files_to_change: Vec<String>,
    #[serde(default)]
    pub code_changes: Option<String>,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub backlog_note: Option<String>,
    #[serde(default)]
    pub spec_changes: Option<String>,
    #[serde(default)]
    pub task_changes: Option<String>,
    #[serde(default)]
    pub what_is_needed: Option<String>,
    #[serde(default)]
    pub options_for_human: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategistResponse {
    pub decision: EscalationDecision,
    pub reasoning: String,
    #[serde(default)]
    pub action: StrategistAction,
}

fn joined(parts: &[Option<String>]) -> Option<String> {
    let parts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.as_deref())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

impl StrategistResponse {
    pub fn into_resolution(self) -> Resolution {
        let action = self.action;
        let mut resolution = Resolution::new(self.decision, self.reasoning);
        match self.decision {
            EscalationDecision::DifferentApproach => {
                let files = (!action.files_to_change.is_empty())
                    .then(|| format!("Files: {}", action.files_to_change.join(", ")));
                resolution.guidance = joined(&[action.solution, files, action.code_changes]);
            }
            EscalationDecision::SkipTask => {
                resolution.backlog_note = joined(&[action.backlog_note, action.impact]);
            }
            EscalationDecision::ModifySpec => {
                resolution.human_needed = joined(&[action.spec_changes, action.task_changes]);
            }
            EscalationDecision::NeedHuman => {
                resolution.human_needed = action.what_is_needed;
                resolution.human_options = action.options_for_human;
            }
        }
        resolution
    }
}

/// Oracle advice for a stuck task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleResponse {
    /// Why the task is likely stuck
    pub analysis: String,
    /// Concrete steps for the next attempt
    pub guidance: String,
    #[serde(default)]
    pub escalate: bool,
}

fn payload<'a>(collaborator: &'static str, text: &'a str) -> Result<&'a str, CollaboratorError> {
    extract_json(text).ok_or_else(|| CollaboratorError::Parse {
        collaborator,
        message: "no JSON object in response".to_string(),
    })
}

/// Parse reviewer output. A rejection without issues gets a placeholder issue
/// so the worker always has something to act on.
pub fn parse_review_response(text: &str) -> Result<ReviewResponse, CollaboratorError> {
    let json = payload(REVIEWER, text)?;
    let mut response: ReviewResponse =
        serde_json::from_str(json).map_err(|e| CollaboratorError::Parse {
            collaborator: REVIEWER,
            message: e.to_string(),
        })?;
    if !response.approved && response.issues.is_empty() {
        response
            .issues
            .push("Reviewer rejected the change without listing issues".to_string());
    }
    Ok(response)
}

pub fn parse_strategist_response(text: &str) -> Result<StrategistResponse, CollaboratorError> {
    let json = payload(STRATEGIST, text)?;
    serde_json::from_str(json).map_err(|e| CollaboratorError::Parse {
        collaborator: STRATEGIST,
        message: e.to_string(),
    })
}

pub fn parse_oracle_response(text: &str) -> Result<OracleResponse, CollaboratorError> {
    let json = payload(ORACLE, text)?;
    serde_json::from_str(json).map_err(|e| CollaboratorError::Parse {
        collaborator: ORACLE,
        message: e.to_string(),
    })
}
