//! Built-in analysis agents
//!
//! Each agent claims a slice of the category space, builds a prompt for its
//! document kind, sends it through the LLM service and parses a JSON object
//! out of the reply. The generic agent claims nothing and is assigned by
//! the orchestrator when resolution comes back empty.

mod parse;

use async_trait::async_trait;

use crate::classify::FileCategory;
use crate::error::LlmError;
use crate::llm::{LlmRequest, LlmService};
use crate::orchestrator::FileTask;
use crate::registry::AnalysisAgent;
use parse::extract_json_object;

/// Longest content preview embedded in a prompt
const MAX_PREVIEW_CHARS: usize = 2000;

/// Printable preview of file content, or `None` for binary payloads.
///
/// Binary formats (plotted PDFs, CAD databases, photos) produce mojibake
/// when lossy-decoded; agents then describe the file from its name and
/// category instead of pasting garbage into the prompt.
fn printable_preview(data: &[u8], max_chars: usize) -> Option<String> {
    let sample = &data[..data.len().min(4096)];
    let text = String::from_utf8_lossy(sample);
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count();
    if printable * 10 < text.chars().count() * 9 {
        return None;
    }
    Some(text.chars().take(max_chars).collect())
}

/// Send one prompt and parse the reply into a JSON object
async fn prompt_for_json(
    llm: &LlmService,
    agent: &str,
    prompt: String,
) -> Result<serde_json::Value, LlmError> {
    let request = LlmRequest::new(prompt)
        .with_system("You are a construction document analyst. Respond only with valid JSON.");
    let response = llm.call(&request).await?;

    let json_str = extract_json_object(&response.content).ok_or(LlmError::InvalidResponse)?;
    match serde_json::from_str(&json_str) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(agent, error = %e, "reply was not parseable JSON");
            Err(LlmError::InvalidResponse)
        }
    }
}

fn describe_content(task: &FileTask) -> String {
    match printable_preview(&task.content, MAX_PREVIEW_CHARS) {
        Some(preview) => format!("Content excerpt:\n{}", preview),
        None => format!(
            "Content is binary ({} bytes); work from the filename and category.",
            task.content.len()
        ),
    }
}

/// Analyzes specifications, reports and plain-text documents
pub struct SpecificationAgent;

#[async_trait]
impl AnalysisAgent for SpecificationAgent {
    fn name(&self) -> &str {
        "spec-analyst"
    }

    fn categories(&self) -> &[FileCategory] {
        &[
            FileCategory::Specification,
            FileCategory::Report,
            FileCategory::Text,
        ]
    }

    fn priority(&self) -> u8 {
        80
    }

    async fn analyze(
        &self,
        task: &FileTask,
        llm: &LlmService,
    ) -> Result<serde_json::Value, LlmError> {
        let prompt = format!(
            r#"Analyze this construction document.

Filename: {}
{}

Provide a JSON response:
{{
  "summary": "2-3 sentences: what the document covers, which trades or CSI divisions it touches, key requirements",
  "divisions": ["03 Concrete", "05 Metals"],
  "key_entities": ["specific project names, companies, standards (e.g. 'ASTM C150'), dates, amounts"],
  "confidence": 0.85
}}

Return ONLY valid JSON. No markdown, no explanation."#,
            task.filename,
            describe_content(task)
        );
        prompt_for_json(llm, self.name(), prompt).await
    }
}

/// Analyzes schedules, takeoffs and cost spreadsheets
pub struct ScheduleAgent;

#[async_trait]
impl AnalysisAgent for ScheduleAgent {
    fn name(&self) -> &str {
        "schedule-analyst"
    }

    fn categories(&self) -> &[FileCategory] {
        &[FileCategory::Spreadsheet]
    }

    fn priority(&self) -> u8 {
        70
    }

    async fn analyze(
        &self,
        task: &FileTask,
        llm: &LlmService,
    ) -> Result<serde_json::Value, LlmError> {
        let prompt = format!(
            r#"Analyze this construction spreadsheet (schedule, quantity takeoff or cost sheet).

Filename: {}
{}

Provide a JSON response:
{{
  "summary": "what the sheet tracks and over what period or scope",
  "sheet_kind": "one of: schedule, takeoff, cost, submittal_log, other",
  "key_entities": ["milestones, line items, totals, subcontractors"],
  "confidence": 0.8
}}

Return ONLY valid JSON."#,
            task.filename,
            describe_content(task)
        );
        prompt_for_json(llm, self.name(), prompt).await
    }
}

/// Analyzes drawings and site photos
pub struct DrawingAgent;

#[async_trait]
impl AnalysisAgent for DrawingAgent {
    fn name(&self) -> &str {
        "drawing-analyst"
    }

    fn categories(&self) -> &[FileCategory] {
        &[FileCategory::Drawing, FileCategory::Photo]
    }

    fn priority(&self) -> u8 {
        60
    }

    async fn analyze(
        &self,
        task: &FileTask,
        llm: &LlmService,
    ) -> Result<serde_json::Value, LlmError> {
        let prompt = format!(
            r#"Analyze this construction drawing or site photo from its metadata.

Filename: {}
Category: {}
{}

Sheet numbers follow patterns like A-101 (architectural), S-201 (structural),
M-301 (mechanical), E-401 (electrical), C-101 (civil).

Provide a JSON response:
{{
  "summary": "best-effort description of what the sheet or photo shows",
  "discipline": "one of: architectural, structural, mechanical, electrical, civil, unknown",
  "sheet_number": "A-101 or null",
  "confidence": 0.6
}}

Return ONLY valid JSON."#,
            task.filename,
            task.category.map(|c| c.as_str()).unwrap_or("unknown"),
            describe_content(task)
        );
        prompt_for_json(llm, self.name(), prompt).await
    }
}

/// Best-effort fallback when no registered agent claims a category.
///
/// Claims no categories itself; the orchestrator assigns it explicitly.
pub struct GenericAgent;

#[async_trait]
impl AnalysisAgent for GenericAgent {
    fn name(&self) -> &str {
        "generalist"
    }

    fn categories(&self) -> &[FileCategory] {
        &[]
    }

    fn priority(&self) -> u8 {
        0
    }

    async fn analyze(
        &self,
        task: &FileTask,
        llm: &LlmService,
    ) -> Result<serde_json::Value, LlmError> {
        let prompt = format!(
            r#"Analyze this construction project file. No specialized analyst
claimed it, so give a best-effort description.

Filename: {}
{}

Provide a JSON response:
{{
  "summary": "what this file most likely is and why it matters to the project",
  "key_entities": [],
  "confidence": 0.4
}}

Return ONLY valid JSON."#,
            task.filename,
            describe_content(task)
        );
        prompt_for_json(llm, self.name(), prompt).await
    }
}

/// The default registration list handed to the registry at startup
pub fn default_agents() -> Vec<std::sync::Arc<dyn AnalysisAgent>> {
    vec![
        std::sync::Arc::new(SpecificationAgent),
        std::sync::Arc::new(ScheduleAgent),
        std::sync::Arc::new(DrawingAgent),
    ]
}
