//! Result aggregation
//!
//! `aggregate` is a pure function from per-task outcomes to the merged
//! report: it preserves input order, computes the summary counts and batch
//! status, and performs no I/O. The timestamp is passed in by the caller so
//! the same inputs always produce the same report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::FileCategory;
use crate::error::AnalysisError;

/// Overall outcome of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every task succeeded
    Success,
    /// Mixed outcomes; the expected case, not an exceptional one
    Partial,
    /// Every task failed
    Error,
    /// The batch contained no files at all
    NoInput,
}

/// Outcome of one file task, immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub task_id: Uuid,
    /// Agent that produced the outcome; `"classifier"` for files that never
    /// made it past validation
    pub agent_id: String,
    pub filename: String,
    pub category: Option<FileCategory>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisError>,
}

impl AnalysisResult {
    pub fn success(
        task_id: Uuid,
        agent_id: &str,
        filename: &str,
        category: Option<FileCategory>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id,
            agent_id: agent_id.to_string(),
            filename: filename.to_string(),
            category,
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(
        task_id: Uuid,
        agent_id: &str,
        filename: &str,
        category: Option<FileCategory>,
        error: AnalysisError,
    ) -> Self {
        Self {
            task_id,
            agent_id: agent_id.to_string(),
            filename: filename.to_string(),
            category,
            success: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Summary counts; `total == successful + failed` always holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Final aggregated output of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedReport {
    pub batch_id: Uuid,
    pub batch_status: BatchStatus,
    pub results: Vec<AnalysisResult>,
    pub summary: ReportSummary,
    /// True when some configured provider had no credentials for this run
    pub degraded: bool,
    pub generated_at: DateTime<Utc>,
}

/// Combine per-task outcomes into one report
pub fn aggregate(
    batch_id: Uuid,
    results: Vec<AnalysisResult>,
    degraded: bool,
    generated_at: DateTime<Utc>,
) -> MergedReport {
    let total = results.len();
    let successful = results.iter().filter(|r| r.success).count();
    let failed = total - successful;

    let batch_status = if total == 0 {
        BatchStatus::NoInput
    } else if failed == 0 {
        BatchStatus::Success
    } else if successful == 0 {
        BatchStatus::Error
    } else {
        BatchStatus::Partial
    };

    MergedReport {
        batch_id,
        batch_status,
        results,
        summary: ReportSummary {
            total,
            successful,
            failed,
        },
        degraded,
        generated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn ok(name: &str) -> AnalysisResult {
        AnalysisResult::success(
            Uuid::new_v4(),
            "spec-analyst",
            name,
            Some(FileCategory::Specification),
            serde_json::json!({"summary": "fine"}),
        )
    }

    fn bad(name: &str) -> AnalysisResult {
        AnalysisResult::failure(
            Uuid::new_v4(),
            "classifier",
            name,
            None,
            AnalysisError::Validation(ValidationError::EmptyFile),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_summary_counts_always_balance() {
        let report = aggregate(
            Uuid::new_v4(),
            vec![ok("a.pdf"), bad("b.pdf"), ok("c.xlsx"), bad("d.txt")],
            false,
            now(),
        );
        assert_eq!(report.summary.total, 4);
        assert_eq!(
            report.summary.total,
            report.summary.successful + report.summary.failed
        );
    }

    #[test]
    fn test_all_success_status() {
        let report = aggregate(Uuid::new_v4(), vec![ok("a.pdf")], false, now());
        assert_eq!(report.batch_status, BatchStatus::Success);
    }

    #[test]
    fn test_mixed_status_is_partial() {
        let report = aggregate(Uuid::new_v4(), vec![ok("a.pdf"), bad("b.pdf")], false, now());
        assert_eq!(report.batch_status, BatchStatus::Partial);
    }

    #[test]
    fn test_all_failed_status_is_error() {
        let report = aggregate(Uuid::new_v4(), vec![bad("a.pdf")], false, now());
        assert_eq!(report.batch_status, BatchStatus::Error);
    }

    #[test]
    fn test_empty_batch_is_no_input() {
        let report = aggregate(Uuid::new_v4(), vec![], false, now());
        assert_eq!(report.batch_status, BatchStatus::NoInput);
        assert_eq!(report.summary.total, 0);
    }

    #[test]
    fn test_aggregate_is_deterministic_and_order_preserving() {
        let batch_id = Uuid::new_v4();
        let stamp = now();
        let results = vec![ok("1.pdf"), bad("2.pdf"), ok("3.pdf")];

        let first = aggregate(batch_id, results.clone(), true, stamp);
        let second = aggregate(batch_id, results.clone(), true, stamp);

        assert_eq!(first, second);
        let names: Vec<&str> = first.results.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["1.pdf", "2.pdf", "3.pdf"]);
    }

    #[test]
    fn test_degraded_flag_is_carried() {
        let report = aggregate(Uuid::new_v4(), vec![ok("a.pdf")], true, now());
        assert!(report.degraded);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = aggregate(Uuid::new_v4(), vec![bad("x.pdf")], false, now());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["batchStatus"].is_string());
        assert_eq!(json["summary"]["failed"], 1);
        assert_eq!(json["results"][0]["error"]["kind"], "validation");
    }
}
