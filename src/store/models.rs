use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The enumerated tag identifying which generated artifact a job concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    LeanCanvas,
    ProjectRequirements,
    BusinessRequirements,
    FunctionalRequirements,
    Workflows,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeanCanvas => "lean_canvas",
            Self::ProjectRequirements => "project_requirements",
            Self::BusinessRequirements => "business_requirements",
            Self::FunctionalRequirements => "functional_requirements",
            Self::Workflows => "workflows",
        }
    }

    /// All kinds, in generation-chain order. Used when gathering upstream
    /// context ids for the external generator.
    pub fn all() -> &'static [DocumentKind] {
        &[
            Self::LeanCanvas,
            Self::ProjectRequirements,
            Self::BusinessRequirements,
            Self::FunctionalRequirements,
            Self::Workflows,
        ]
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lean_canvas" => Ok(Self::LeanCanvas),
            "project_requirements" => Ok(Self::ProjectRequirements),
            "business_requirements" => Ok(Self::BusinessRequirements),
            "functional_requirements" => Ok(Self::FunctionalRequirements),
            "workflows" => Ok(Self::Workflows),
            _ => Err(format!("Invalid document kind: {}", s)),
        }
    }
}

/// Job lifecycle: `Pending → Processing → {Completed | Failed}`.
/// Terminal states never transition out; the store does not enforce this
/// (it is data-only), callers only issue forward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Status of the durable document artifact. Mirrors, but is distinct from,
/// the job status: the document survives across generation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Generating,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "generating" => Ok(Self::Generating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid document status: {}", s)),
        }
    }
}

/// An owning account. All tenant-owned rows carry a `tenant_id`; the API
/// authenticates requests against `api_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub created_at: String,
}

/// The generation subject: a business idea owning a tree of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idea {
    pub id: i64,
    pub tenant_id: i64,
    pub title: String,
    pub description: String,
    pub created_at: String,
}

/// A derived document. `external_id` is the opaque correlation identifier
/// returned by the external generator for the current generation attempt;
/// it is replaced on re-generation and never cleared to NULL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub idea_id: i64,
    pub tenant_id: i64,
    pub kind: DocumentKind,
    pub status: DocumentStatus,
    pub content: String,
    pub external_id: Option<String>,
    pub generation_started_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// The tracking record for one generation attempt. Never physically
/// deleted; its id is globally unique and externally shareable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub tenant_id: i64,
    pub idea_id: i64,
    pub kind: DocumentKind,
    pub status: JobStatus,
    pub progress: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update for a job. `update_job` applies only the populated
/// fields; it performs no state-machine validation.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<String>,
}

/// API view: an idea together with its documents and the most recent
/// generation job across all kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeaDetail {
    pub idea: Idea,
    pub documents: Vec<Document>,
    pub latest_job: Option<GenerationJob>,
}
