//! File Classifier
//!
//! Maps raw bytes plus a declared filename to a logical category. The
//! declared extension is checked against a per-category allow-list, then the
//! content signature (magic bytes) is checked against what that extension
//! should contain, so a renamed executable never reaches an agent.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ValidationError;

/// Logical document category for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    /// Plans, sections, details (CAD or plotted sets)
    Drawing,
    /// Technical specifications and submittals
    Specification,
    /// Schedules, quantity takeoffs, cost sheets
    Spreadsheet,
    /// Narrative reports, correspondence, meeting minutes
    Report,
    /// Site and progress photos
    Photo,
    /// Plain-text notes and logs
    Text,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drawing => "drawing",
            Self::Specification => "specification",
            Self::Spreadsheet => "spreadsheet",
            Self::Report => "report",
            Self::Photo => "photo",
            Self::Text => "text",
        }
    }
}

/// How sure the classifier is about the category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    /// The extension is claimed by more than one category; the orchestrator
    /// may consult a secondary agent
    Low,
}

/// One category's claim on a set of extensions
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub category: FileCategory,
    /// Higher wins when several categories claim the same extension
    pub priority: u8,
    pub extensions: Vec<&'static str>,
}

/// Default allow-list for the construction document set.
///
/// `pdf` is deliberately claimed twice: specification sets and plotted
/// drawing sets both ship as PDF, so a bare `.pdf` classifies as a
/// specification with low confidence.
static DEFAULT_RULES: Lazy<Vec<CategoryRule>> = Lazy::new(|| {
    vec![
        CategoryRule {
            category: FileCategory::Specification,
            priority: 80,
            extensions: vec!["pdf"],
        },
        CategoryRule {
            category: FileCategory::Spreadsheet,
            priority: 70,
            extensions: vec!["xlsx", "xls", "csv"],
        },
        CategoryRule {
            category: FileCategory::Drawing,
            priority: 60,
            extensions: vec!["dwg", "dxf", "pdf"],
        },
        CategoryRule {
            category: FileCategory::Report,
            priority: 50,
            extensions: vec!["docx", "doc"],
        },
        CategoryRule {
            category: FileCategory::Photo,
            priority: 40,
            extensions: vec!["jpg", "jpeg", "png", "webp"],
        },
        CategoryRule {
            category: FileCategory::Text,
            priority: 30,
            extensions: vec!["txt", "md", "log"],
        },
    ]
});

/// What the classifier decided for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category: FileCategory,
    pub confidence: Confidence,
    pub extension: String,
}

/// Known content signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signature {
    Pdf,
    /// ZIP container (xlsx, docx)
    Zip,
    /// Legacy Compound File Binary (xls, doc)
    Cfb,
    Png,
    Jpeg,
    Webp,
    /// AutoCAD drawing database
    AutoCad,
    /// PE executable
    Executable,
    Elf,
    /// Nothing recognized; plausible for plain text
    Unknown,
}

impl Signature {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Zip => "zip",
            Self::Cfb => "cfb",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
            Self::AutoCad => "autocad",
            Self::Executable => "executable",
            Self::Elf => "elf",
            Self::Unknown => "unknown",
        }
    }
}

/// Detect a content signature from magic bytes
fn detect_signature(data: &[u8]) -> Signature {
    if data.starts_with(b"%PDF") {
        Signature::Pdf
    } else if data.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        Signature::Zip
    } else if data.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        Signature::Cfb
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Signature::Png
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Signature::Jpeg
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(b"WEBP") {
        Signature::Webp
    } else if data.starts_with(b"AC10") {
        Signature::AutoCad
    } else if data.starts_with(b"MZ") {
        Signature::Executable
    } else if data.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        Signature::Elf
    } else {
        Signature::Unknown
    }
}

/// Signatures acceptable for an extension. Empty means text-like: anything
/// goes as long as no binary signature is recognized.
fn expected_signatures(extension: &str) -> &'static [Signature] {
    match extension {
        "pdf" => &[Signature::Pdf],
        "xlsx" | "docx" => &[Signature::Zip],
        "xls" | "doc" => &[Signature::Cfb],
        "png" => &[Signature::Png],
        "jpg" | "jpeg" => &[Signature::Jpeg],
        "webp" => &[Signature::Webp],
        "dwg" => &[Signature::AutoCad],
        // dxf, csv, txt, md, log are text formats
        _ => &[],
    }
}

/// Validates and categorizes incoming files
pub struct Classifier {
    rules: Vec<CategoryRule>,
    max_file_size: u64,
}

impl Classifier {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
            max_file_size,
        }
    }

    /// Replace the allow-list, e.g. from the configuration collaborator
    pub fn with_rules(rules: Vec<CategoryRule>, max_file_size: u64) -> Self {
        Self {
            rules,
            max_file_size,
        }
    }

    /// Classify one file. Prior validation by the upload layer is not
    /// trusted; everything is re-checked here.
    pub fn classify(&self, filename: &str, data: &[u8]) -> Result<Classification, ValidationError> {
        if data.is_empty() {
            return Err(ValidationError::EmptyFile);
        }
        if data.len() as u64 > self.max_file_size {
            return Err(ValidationError::SizeExceeded {
                size: data.len() as u64,
                limit: self.max_file_size,
            });
        }

        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let mut candidates: Vec<&CategoryRule> = self
            .rules
            .iter()
            .filter(|r| r.extensions.contains(&extension.as_str()))
            .collect();

        if candidates.is_empty() {
            tracing::debug!(
                filename,
                mime = %mime_guess::from_ext(&extension).first_or_octet_stream(),
                "extension not in allow-list"
            );
            return Err(ValidationError::UnknownExtension { extension });
        }

        self.check_signature(&extension, data)?;

        // Stable sort keeps rule-table order as the tie-break
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let confidence = if candidates.len() > 1 {
            Confidence::Low
        } else {
            Confidence::High
        };

        Ok(Classification {
            category: candidates[0].category,
            confidence,
            extension,
        })
    }

    /// Reject content whose magic bytes contradict the declared extension
    fn check_signature(&self, extension: &str, data: &[u8]) -> Result<(), ValidationError> {
        let detected = detect_signature(data);
        let expected = expected_signatures(extension);

        let ok = if expected.is_empty() {
            // Text formats: any recognized binary signature is a spoof
            detected == Signature::Unknown
        } else {
            expected.contains(&detected)
        };

        if !ok {
            tracing::warn!(
                extension,
                detected = detected.as_str(),
                "content signature mismatch"
            );
            return Err(ValidationError::SignatureMismatch {
                extension: extension.to_string(),
                detected: detected.as_str().to_string(),
            });
        }
        Ok(())
    }
}
