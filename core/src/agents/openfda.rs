//! openFDA drug endpoints: adverse events, labels, enforcement reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use super::{first_str, SourceClient};
use crate::errors::GenieError;

const SOURCE: &str = "openfda";
const REACTION_FIELD: &str = "patient.reaction.reactionmeddrapt.exact";
const OVERVIEW_REACTIONS: u32 = 10;
const OVERVIEW_RECALLS: u32 = 10;
/// Longest accepted look-back, in days (50 years).
const MAX_WINDOW_DAYS: i64 = 50 * 365;

/// Look-back window for adverse-event queries, written `Ny` or `Nm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    days: i64,
}

impl TimeWindow {
    pub fn parse(raw: &str) -> Result<Self, GenieError> {
        let raw = raw.trim().to_lowercase();
        let invalid = || {
            GenieError::InvalidRequest(format!("invalid time window '{raw}', expected e.g. 1y or 6m"))
        };
        let (split, _) = raw.char_indices().last().ok_or_else(invalid)?;
        let (count, unit) = raw.split_at(split);
        let count: i64 = count.parse().map_err(|_| invalid())?;
        if count <= 0 {
            return Err(invalid());
        }
        let per_unit = match unit {
            "y" => 365,
            "m" => 30,
            _ => return Err(invalid()),
        };
        match count.checked_mul(per_unit) {
            Some(days) if days <= MAX_WINDOW_DAYS => Ok(Self { days }),
            _ => Err(GenieError::InvalidRequest(format!(
                "time window '{raw}' exceeds the 50 year limit"
            ))),
        }
    }

    /// `receivedate` range query ending on `today`.
    fn range_query(&self, today: Date) -> Result<String, GenieError> {
        let out_of_range =
            || GenieError::InvalidRequest(format!("time window of {} days is out of range", self.days));
        let start = today
            .checked_sub(time::Duration::days(self.days))
            .ok_or_else(out_of_range)?;
        let fmt = format_description!("[year][month][day]");
        let (Ok(from), Ok(to)) = (start.format(fmt), today.format(fmt)) else {
            return Err(out_of_range());
        };
        Ok(format!("receivedate:[{from} TO {to}]"))
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self { days: 365 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionCount {
    pub term: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdverseEventReport {
    pub report_id: String,
    pub date_received: String,
    pub drug_name: String,
    pub reactions: Vec<String>,
    pub serious: bool,
    pub outcomes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrugLabel {
    pub drug_name: String,
    pub generic_name: String,
    pub brand_name: String,
    pub manufacturer: String,
    pub purpose: String,
    pub warnings: String,
    pub indications_and_usage: String,
    pub dosage_and_administration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnforcementReport {
    pub recall_number: String,
    pub reason_for_recall: String,
    pub status: String,
    pub classification: String,
    pub product_description: String,
    pub recalling_firm: String,
    pub distribution_pattern: String,
    pub recall_initiation_date: String,
    pub report_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyOverview {
    pub drug_name: String,
    pub label: DrugLabel,
    pub top_reactions: Vec<ReactionCount>,
    pub recalls: Vec<EnforcementReport>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct OpenFdaAgent {
    client: SourceClient,
    base: String,
}

impl OpenFdaAgent {
    pub fn new(client: SourceClient, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Most frequently reported reactions for `drug` within `window`.
    pub async fn reaction_counts(
        &self,
        drug: &str,
        window: TimeWindow,
        limit: u32,
    ) -> Result<Vec<ReactionCount>, GenieError> {
        let params = [
            ("search", event_search(drug, window)?),
            ("count", REACTION_FIELD.to_string()),
            ("limit", clamp_limit(limit).to_string()),
        ];
        let body = self.get("event.json", &params).await?;
        Ok(body.as_ref().map(parse_reaction_counts).unwrap_or_default())
    }

    pub async fn recent_reports(
        &self,
        drug: &str,
        window: TimeWindow,
        limit: u32,
    ) -> Result<Vec<AdverseEventReport>, GenieError> {
        let params = [
            ("search", event_search(drug, window)?),
            ("limit", clamp_limit(limit).to_string()),
        ];
        let body = self.get("event.json", &params).await?;
        Ok(body
            .as_ref()
            .map(|b| parse_event_reports(b, drug))
            .unwrap_or_default())
    }

    /// Label by brand name, then generic name, then free text.
    pub async fn label(&self, drug: &str) -> Result<Option<DrugLabel>, GenieError> {
        let drug = drug.trim();
        let searches = [
            format!("openfda.brand_name:\"{drug}\""),
            format!("openfda.generic_name:\"{drug}\""),
            format!("\"{drug}\""),
        ];
        for search in searches {
            let params = [("search", search), ("limit", "1".to_string())];
            if let Some(body) = self.get("label.json", &params).await? {
                if let Some(label) = parse_label(&body, drug) {
                    return Ok(Some(label));
                }
            }
        }
        Ok(None)
    }

    pub async fn enforcement_reports(
        &self,
        drug: &str,
        limit: u32,
    ) -> Result<Vec<EnforcementReport>, GenieError> {
        let params = [
            ("search", format!("product_description:\"{}\"", drug.trim())),
            ("limit", clamp_limit(limit).to_string()),
        ];
        let body = self.get("enforcement.json", &params).await?;
        Ok(body.as_ref().map(parse_enforcement).unwrap_or_default())
    }

    /// Label first; a drug without a label is reported as not found and
    /// no further queries are made.
    pub async fn safety_overview(&self, drug: &str) -> Result<Option<SafetyOverview>, GenieError> {
        let Some(label) = self.label(drug).await? else {
            return Ok(None);
        };
        let top_reactions = self
            .reaction_counts(drug, TimeWindow::default(), OVERVIEW_REACTIONS)
            .await?;
        let recalls = self.enforcement_reports(drug, OVERVIEW_RECALLS).await?;
        let warnings = if label.warnings == "N/A" {
            Vec::new()
        } else {
            vec![label.warnings.clone()]
        };
        Ok(Some(SafetyOverview {
            drug_name: drug.trim().to_string(),
            label,
            top_reactions,
            recalls,
            warnings,
        }))
    }

    async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Option<Value>, GenieError> {
        self.client
            .get_json(SOURCE, &format!("{}/{endpoint}", self.base), params)
            .await
    }
}

fn event_search(drug: &str, window: TimeWindow) -> Result<String, GenieError> {
    let today = OffsetDateTime::now_utc().date();
    Ok(format!(
        "{} AND patient.drug.medicinalproduct:\"{}\"",
        window.range_query(today)?,
        drug.trim()
    ))
}

fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, 100)
}

fn results(body: &Value) -> &[Value] {
    body.get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_reaction_counts(body: &Value) -> Vec<ReactionCount> {
    results(body)
        .iter()
        .filter_map(|row| {
            Some(ReactionCount {
                term: row.get("term")?.as_str()?.to_string(),
                count: row.get("count")?.as_u64()?,
            })
        })
        .collect()
}

fn parse_event_reports(body: &Value, drug: &str) -> Vec<AdverseEventReport> {
    results(body)
        .iter()
        .map(|report| {
            let reactions = report
                .pointer("/patient/reaction")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            AdverseEventReport {
                report_id: text_or(report, "safetyreportid", "Unknown"),
                date_received: text_or(report, "receivedate", "Unknown"),
                drug_name: report
                    .pointer("/patient/drug/0/medicinalproduct")
                    .and_then(Value::as_str)
                    .unwrap_or(drug)
                    .to_string(),
                reactions: reactions
                    .iter()
                    .filter_map(|r| r.get("reactionmeddrapt").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect(),
                serious: report.get("serious").and_then(Value::as_str) == Some("1"),
                outcomes: reactions
                    .iter()
                    .filter_map(|r| r.get("reactionoutcome").and_then(Value::as_str))
                    .map(outcome_label)
                    .collect(),
            }
        })
        .collect()
}

fn outcome_label(code: &str) -> String {
    match code {
        "1" => "Recovered/resolved",
        "2" => "Recovering/resolving",
        "3" => "Not recovered/not resolved",
        "4" => "Recovered with sequelae",
        "5" => "Fatal",
        _ => "Unknown",
    }
    .to_string()
}

fn parse_label(body: &Value, drug: &str) -> Option<DrugLabel> {
    let result = results(body).first()?;
    let openfda = result.get("openfda").cloned().unwrap_or(Value::Null);
    let joined = |key: &str, fallback: &str| {
        openfda
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    };
    let section = |key: &str| first_str(result, key).unwrap_or("N/A").trim().to_string();

    Some(DrugLabel {
        drug_name: drug.to_string(),
        generic_name: joined("generic_name", "N/A"),
        brand_name: joined("brand_name", drug),
        manufacturer: joined("manufacturer_name", "N/A"),
        purpose: section("purpose"),
        warnings: section("warnings"),
        indications_and_usage: section("indications_and_usage"),
        dosage_and_administration: section("dosage_and_administration"),
    })
}

fn parse_enforcement(body: &Value) -> Vec<EnforcementReport> {
    results(body)
        .iter()
        .map(|row| EnforcementReport {
            recall_number: text_or(row, "recall_number", "Not available"),
            reason_for_recall: text_or(row, "reason_for_recall", "Not specified"),
            status: text_or(row, "status", "Not specified"),
            classification: text_or(row, "classification", "Not specified"),
            product_description: text_or(row, "product_description", "Not specified"),
            recalling_firm: text_or(row, "recalling_firm", "Not specified"),
            distribution_pattern: text_or(row, "distribution_pattern", "Not specified"),
            recall_initiation_date: text_or(row, "recall_initiation_date", "Not specified"),
            report_date: text_or(row, "report_date", "Not specified"),
        })
        .collect()
}

fn text_or(value: &Value, key: &str, fallback: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}
