//! Deterministic merge of per-backend responses.
//!
//! The highest-confidence response wins; ties go to the backend registered
//! first. Content is never blended: every responder is listed in `sources`
//! and `perspectives`, and responses differing from the selected one are
//! listed again in `outliers` so disagreement stays visible.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backends::MemoryResponse;

/// Outcome class of a recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    /// Every registered backend returned content.
    Success,
    /// Some, but not all, backends returned content.
    Partial,
    /// No backend returned content.
    NoMemories,
}

impl SynthesisStatus {
    /// Get the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::NoMemories => "no_memories",
        }
    }
}

impl std::fmt::Display for SynthesisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response whose content differs from the selected one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub source: String,
    pub content: Value,
    pub confidence: f64,
}

/// Merged answer of a recall across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub status: SynthesisStatus,
    /// Backends that returned content, in registration order.
    pub sources: Vec<String>,
    /// Selected content; `None` when nothing was found.
    pub content: Option<Value>,
    /// Confidence of the selected response.
    pub confidence: f64,
    /// Backend whose response was selected.
    pub primary_source: Option<String>,
    /// At least two backends returned the selected content.
    pub consensus: bool,
    /// What each responding backend returned.
    pub perspectives: BTreeMap<String, Value>,
    /// Responses that disagree with the selected content, in registration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outliers: Vec<Outlier>,
    /// Mean retrieval time of the responses, in seconds.
    #[serde(default)]
    pub avg_retrieval_time: f64,
}

impl SynthesisResult {
    /// Result for a recall where nothing came back.
    pub fn no_memories() -> Self {
        Self {
            status: SynthesisStatus::NoMemories,
            sources: Vec::new(),
            content: None,
            confidence: 0.0,
            primary_source: None,
            consensus: false,
            perspectives: BTreeMap::new(),
            outliers: Vec::new(),
            avg_retrieval_time: 0.0,
        }
    }

    /// Whether any backend returned content.
    pub fn found(&self) -> bool {
        self.status != SynthesisStatus::NoMemories
    }
}

/// Merge responses collected from `expected` backends.
///
/// `responses` must be in backend registration order; the first of several
/// equally confident responses is selected.
pub fn synthesize(responses: Vec<MemoryResponse>, expected: usize) -> SynthesisResult {
    let mut primary: Option<(usize, f64)> = None;
    for (idx, response) in responses.iter().enumerate() {
        let confidence = response.normalized_confidence();
        match primary {
            Some((_, best)) if confidence <= best => {}
            _ => primary = Some((idx, confidence)),
        }
    }

    let Some((idx, confidence)) = primary else {
        return SynthesisResult::no_memories();
    };

    let selected = &responses[idx];
    let agreeing = responses
        .iter()
        .filter(|r| r.content == selected.content)
        .count();

    let outliers = responses
        .iter()
        .filter(|r| r.content != selected.content)
        .map(|r| Outlier {
            source: r.source_backend.clone(),
            content: r.content.clone(),
            confidence: r.normalized_confidence(),
        })
        .collect();
    let avg_retrieval_time =
        responses.iter().map(|r| r.retrieval_time).sum::<f64>() / responses.len() as f64;

    let status = if responses.len() < expected {
        SynthesisStatus::Partial
    } else {
        SynthesisStatus::Success
    };

    SynthesisResult {
        status,
        sources: responses.iter().map(|r| r.source_backend.clone()).collect(),
        content: Some(selected.content.clone()),
        confidence,
        primary_source: Some(selected.source_backend.clone()),
        consensus: agreeing >= 2,
        perspectives: responses
            .iter()
            .map(|r| (r.source_backend.clone(), r.content.clone()))
            .collect(),
        outliers,
        avg_retrieval_time,
    }
}
