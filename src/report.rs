use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::{self, DecodeError};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("decompression failed: {0}")]
    DecompressionFailed(#[from] DecodeError),
    #[error("malformed report: {0}")]
    MalformedSchema(String),
}

/// Root of a DMARC aggregate report (RFC 7489 appendix C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub version: Option<String>,
    pub report_metadata: ReportMetadata,
    pub policy_published: PolicyPublished,
    #[serde(rename = "record", default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub email: String,
    pub extra_contact_info: Option<String>,
    pub report_id: String,
    #[serde(default)]
    pub date_range: DateRange,
    #[serde(rename = "error", default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub begin: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPublished {
    pub domain: String,
    /// DKIM alignment mode
    pub adkim: Option<AlignmentMode>,
    /// SPF alignment mode
    pub aspf: Option<AlignmentMode>,
    /// Policy for the domain
    pub p: Disposition,
    /// Policy for subdomains
    pub sp: Option<Disposition>,
    /// Percentage of messages the policy applies to
    pub pct: Option<u8>,
    /// Failure reporting options
    pub fo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentMode {
    #[serde(rename = "r")]
    Relaxed,
    #[serde(rename = "s")]
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    None,
    Quarantine,
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::None => "none",
            Disposition::Quarantine => "quarantine",
            Disposition::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub row: Row,
    pub identifiers: Identifiers,
    #[serde(default)]
    pub auth_results: AuthResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub source_ip: IpAddr,
    pub count: u64,
    pub policy_evaluated: PolicyEvaluated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluated {
    pub disposition: Disposition,
    pub dkim: AlignmentResult,
    pub spf: AlignmentResult,
    #[serde(rename = "reason", default)]
    pub reasons: Vec<PolicyOverrideReason>,
}

/// Aligned authentication outcome as evaluated against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentResult {
    Pass,
    Fail,
}

impl AlignmentResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignmentResult::Pass => "pass",
            AlignmentResult::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOverrideReason {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifiers {
    pub envelope_to: Option<String>,
    pub envelope_from: Option<String>,
    #[serde(default)]
    pub header_from: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResults {
    #[serde(default)]
    pub dkim: Vec<DkimAuthResult>,
    #[serde(default)]
    pub spf: Vec<SpfAuthResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimAuthResult {
    #[serde(default)]
    pub domain: String,
    pub selector: Option<String>,
    pub result: DkimResult,
    pub human_result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimResult {
    None,
    Pass,
    Fail,
    Policy,
    Neutral,
    TempError,
    PermError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfAuthResult {
    #[serde(default)]
    pub domain: String,
    pub scope: Option<String>,
    pub result: SpfResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl Feedback {
    /// Total message count across all records.
    pub fn total_messages(&self) -> u64 {
        self.records.iter().map(|record| record.row.count).sum()
    }

    /// Count of messages where at least one of DKIM or SPF was aligned.
    pub fn compliant_message_count(&self) -> u64 {
        self.records
            .iter()
            .filter(|record| {
                record.row.policy_evaluated.dkim == AlignmentResult::Pass
                    || record.row.policy_evaluated.spf == AlignmentResult::Pass
            })
            .map(|record| record.row.count)
            .sum()
    }

    pub fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let range = &self.report_metadata.date_range;
        let begin = DateTime::<Utc>::from_timestamp(range.begin, 0)?;
        let end = DateTime::<Utc>::from_timestamp(range.end, 0)?;
        Some((begin, end))
    }

    // A report without its identity cannot be deduplicated, so an empty
    // report_id or domain is rejected rather than defaulted.
    fn validate(&self) -> Result<(), ParseError> {
        if self.report_metadata.report_id.trim().is_empty() {
            return Err(ParseError::MalformedSchema(
                "report_metadata.report_id is empty".to_string(),
            ));
        }
        if self.policy_published.domain.trim().is_empty() {
            return Err(ParseError::MalformedSchema(
                "policy_published.domain is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a raw report attachment into a [`Feedback`].
///
/// The payload is run through the attachment decoder first, so callers
/// hand over attachment bytes as they came off the wire.
pub fn parse_report(data: &[u8]) -> Result<Feedback, ParseError> {
    let decoded = decoder::decode(data)?;

    let text = String::from_utf8(decoded)
        .map_err(|e| ParseError::MalformedSchema(format!("report is not valid UTF-8: {e}")))?;

    let feedback: Feedback = serde_xml_rs::from_str(&text)
        .map_err(|e| ParseError::MalformedSchema(e.to_string()))?;

    feedback.validate()?;
    Ok(feedback)
}
