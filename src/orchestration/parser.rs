//! Worker output parsing.
//!
//! Raw worker output is first classified into a [`WorkerOutput`]: an
//! embedded JSON block (fenced with ```` ```json ```` or a bare JSON
//! document) is a structured payload, anything else is free text. A JSON
//! block that does not decode is [`WorkerOutput::Malformed`] and is reported
//! as a [`ParseFailure`]; the parser never falls back to scraping free text
//! out of a broken block.
//!
//! Free-text extraction only happens when the call site opts in with
//! [`Fallback::FreeText`]. Either way the result is complete-or-empty: a
//! record is only emitted when every field it needs was found.

use crate::core::task::WorkerRole;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::LazyLock;
use thiserror::Error;

/// Fenced JSON block: ```json ... ```
static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").unwrap());

/// `File: path` followed by a fenced block with the full content.
static FILE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^File:[ \t]*(\S+)[ \t]*\r?\n```[^\n]*\n((?s:.*?))```").unwrap()
});

/// `[severity] path:line - message`
static FINDING_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\[(info|warning|error)\][ \t]+(\S+?):(\d+)[ \t]+-[ \t]+(.+?)[ \t]*$")
        .unwrap()
});

/// `PASS name` / `FAIL name`
static TEST_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(PASS|FAIL)[ \t]+(\S.*?)[ \t]*$").unwrap());

/// Raw worker output after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    StructuredPayload(serde_json::Value),
    FreeText(String),
    /// A structured block was present but did not decode.
    Malformed(String),
}

impl WorkerOutput {
    pub fn classify(raw: &str) -> Self {
        if let Some(caps) = JSON_FENCE_RE.captures(raw) {
            return Self::decode(caps[1].trim());
        }
        let trimmed = raw.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Self::decode(trimmed);
        }
        Self::FreeText(raw.to_string())
    }

    fn decode(block: &str) -> Self {
        match serde_json::from_str(block) {
            Ok(value) => Self::StructuredPayload(value),
            Err(e) => Self::Malformed(e.to_string()),
        }
    }
}

/// Expected payload of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    CodeChanges,
    Findings,
    TestOutcomes,
}

impl Shape {
    pub fn for_role(role: WorkerRole) -> Self {
        match role {
            WorkerRole::Implementer | WorkerRole::TestWriter => Shape::CodeChanges,
            WorkerRole::Reviewer => Shape::Findings,
            WorkerRole::Tester => Shape::TestOutcomes,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            Shape::CodeChanges => "changes",
            Shape::Findings => "findings",
            Shape::TestOutcomes => "tests",
        }
    }
}

/// Whether free text may be scraped when no structured block is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    None,
    FreeText,
}

impl Fallback {
    /// Test writers must emit a structured block; the other roles may answer in prose.
    pub fn for_role(role: WorkerRole) -> Self {
        match role {
            WorkerRole::TestWriter => Fallback::None,
            WorkerRole::Implementer | WorkerRole::Reviewer | WorkerRole::Tester => {
                Fallback::FreeText
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    pub path: String,
    pub action: ChangeAction,
    /// Full file content; empty for deletions.
    #[serde(default)]
    pub content: String,
}

impl CodeChange {
    /// The path, if it is relative and stays below its root.
    pub fn relative_path(&self) -> Option<&Path> {
        let path = Path::new(&self.path);
        let contained = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        (contained && !self.path.is_empty()).then_some(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub message: String,
    #[serde(default)]
    pub rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
}

/// A fully-populated record extracted from worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Change(CodeChange),
    Finding(Finding),
    Test(TestOutcome),
}

impl Record {
    /// Identity used to deduplicate aggregated results.
    pub fn signature(&self) -> String {
        match self {
            Record::Change(c) => format!("change:{}", c.path),
            Record::Finding(f) => format!(
                "finding:{}:{}:{}",
                f.file,
                f.line,
                f.rule.as_deref().unwrap_or(&f.message)
            ),
            Record::Test(t) => format!("test:{}", t.name),
        }
    }

    pub fn as_change(&self) -> Option<&CodeChange> {
        match self {
            Record::Change(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("structured block does not decode: {0}")]
    MalformedBlock(String),
    #[error("structured block has no \"{0}\" list")]
    MissingKey(&'static str),
    #[error("record {index} is incomplete: {reason}")]
    IncompleteRecord { index: usize, reason: String },
    #[error("no structured block in output")]
    NoStructuredBlock,
}

/// Parse raw worker output into records of the expected shape.
pub fn parse(raw: &str, shape: Shape, fallback: Fallback) -> Result<Vec<Record>, ParseFailure> {
    match WorkerOutput::classify(raw) {
        WorkerOutput::StructuredPayload(value) => decode_payload(value, shape),
        WorkerOutput::Malformed(err) => Err(ParseFailure::MalformedBlock(err)),
        WorkerOutput::FreeText(text) => match fallback {
            Fallback::None => Err(ParseFailure::NoStructuredBlock),
            Fallback::FreeText => Ok(scrape(&text, shape)),
        },
    }
}

fn decode_payload(value: serde_json::Value, shape: Shape) -> Result<Vec<Record>, ParseFailure> {
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove(shape.key()) {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(ParseFailure::MissingKey(shape.key())),
        },
        _ => return Err(ParseFailure::MissingKey(shape.key())),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let incomplete = |reason: String| ParseFailure::IncompleteRecord { index, reason };
            match shape {
                Shape::CodeChanges => {
                    let change: CodeChange =
                        serde_json::from_value(item).map_err(|e| incomplete(e.to_string()))?;
                    if change.path.trim().is_empty() {
                        return Err(incomplete("empty path".into()));
                    }
                    if change.action != ChangeAction::Delete && change.content.is_empty() {
                        return Err(incomplete(format!("no content for {}", change.path)));
                    }
                    Ok(Record::Change(change))
                }
                Shape::Findings => {
                    let finding: Finding =
                        serde_json::from_value(item).map_err(|e| incomplete(e.to_string()))?;
                    if finding.file.is_empty() || finding.message.is_empty() {
                        return Err(incomplete("finding without file or message".into()));
                    }
                    Ok(Record::Finding(finding))
                }
                Shape::TestOutcomes => serde_json::from_value(item)
                    .map(Record::Test)
                    .map_err(|e| incomplete(e.to_string())),
            }
        })
        .collect()
}

fn scrape(text: &str, shape: Shape) -> Vec<Record> {
    match shape {
        Shape::CodeChanges => FILE_BLOCK_RE
            .captures_iter(text)
            .map(|caps| {
                Record::Change(CodeChange {
                    path: caps[1].to_string(),
                    action: ChangeAction::Modify,
                    content: caps[2].to_string(),
                })
            })
            .collect(),
        Shape::Findings => FINDING_LINE_RE
            .captures_iter(text)
            .filter_map(|caps| {
                Some(Record::Finding(Finding {
                    severity: Severity::parse(&caps[1])?,
                    file: caps[2].to_string(),
                    line: caps[3].parse().ok()?,
                    message: caps[4].to_string(),
                    rule: None,
                }))
            })
            .collect(),
        Shape::TestOutcomes => TEST_LINE_RE
            .captures_iter(text)
            .map(|caps| {
                Record::Test(TestOutcome {
                    name: caps[2].to_string(),
                    passed: &caps[1] == "PASS",
                })
            })
            .collect(),
    }
}
