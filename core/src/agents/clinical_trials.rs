//! ClinicalTrials.gov v2 study search.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, Month};

use super::SourceClient;
use crate::errors::GenieError;

const SOURCE: &str = "clinicaltrials";
const PAGE_SIZE: &str = "20";
const MAX_TRIALS: usize = 10;
const MAX_INSIGHTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trial {
    pub nct_id: String,
    pub title: String,
    pub status: String,
    pub phase: String,
    pub study_type: String,
    pub start_date: String,
    pub completion_date: String,
    pub enrollment: Option<u64>,
    pub conditions: Vec<String>,
    pub interventions: Vec<String>,
    pub sponsor: Option<String>,
    pub summary: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialSummary {
    pub drug: String,
    /// Condition actually applied; `None` when the search fell back to the
    /// drug alone.
    pub condition: Option<String>,
    pub total_count: u64,
    pub phase_ii: usize,
    pub phase_iii: usize,
    pub trials: Vec<Trial>,
    pub insights: Vec<String>,
    pub search_url: String,
}

#[derive(Clone)]
pub struct ClinicalTrialsAgent {
    client: SourceClient,
    base: String,
}

impl ClinicalTrialsAgent {
    pub fn new(client: SourceClient, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Most recently updated studies for `drug`, optionally narrowed by a
    /// condition. A condition that matches nothing is dropped and the
    /// search repeated once. `None` when neither search finds a study.
    pub async fn search(
        &self,
        drug: &str,
        condition: Option<&str>,
    ) -> Result<Option<TrialSummary>, GenieError> {
        let drug = drug.trim();
        let condition = condition.map(str::trim).filter(|c| !c.is_empty());

        if let Some(cond) = condition {
            if let Some(summary) = self.query(drug, Some(cond)).await? {
                return Ok(Some(summary));
            }
            log::info!("no trials for {drug} with condition '{cond}', retrying without it");
        }
        self.query(drug, None).await
    }

    async fn query(
        &self,
        drug: &str,
        condition: Option<&str>,
    ) -> Result<Option<TrialSummary>, GenieError> {
        let mut params = vec![
            ("query.intr", drug.to_string()),
            ("pageSize", PAGE_SIZE.to_string()),
            ("countTotal", "true".to_string()),
            ("sort", "LastUpdatePostDate:desc".to_string()),
        ];
        if let Some(cond) = condition {
            params.push(("query.cond", cond.to_string()));
        }
        let body = self
            .client
            .get_json(SOURCE, &format!("{}/studies", self.base), &params)
            .await?;
        Ok(body.and_then(|body| summarise(drug, condition, &body)))
    }
}

fn summarise(drug: &str, condition: Option<&str>, body: &Value) -> Option<TrialSummary> {
    let trials: Vec<Trial> = body
        .get("studies")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(parse_trial)
        .take(MAX_TRIALS)
        .collect();
    if trials.is_empty() {
        return None;
    }

    let phase_ii = trials.iter().filter(|t| has_phase(&t.phase, "2")).count();
    let phase_iii = trials.iter().filter(|t| has_phase(&t.phase, "3")).count();
    let insights = trials.iter().take(MAX_INSIGHTS).map(insight).collect();
    let total_count = body
        .get("totalCount")
        .and_then(Value::as_u64)
        .unwrap_or(trials.len() as u64);

    Some(TrialSummary {
        drug: drug.to_string(),
        condition: condition.map(str::to_string),
        total_count,
        phase_ii,
        phase_iii,
        trials,
        insights,
        search_url: format!(
            "https://clinicaltrials.gov/search?intr={}",
            urlencoding::encode(drug)
        ),
    })
}

fn parse_trial(study: &Value) -> Option<Trial> {
    let protocol = study.get("protocolSection")?;
    let ident = protocol.get("identificationModule")?;
    let nct_id = ident.get("nctId")?.as_str()?.to_string();
    let text = |v: &Value, ptr: &str| v.pointer(ptr).and_then(Value::as_str).map(str::to_string);
    let list = |ptr: &str, field: Option<&str>| -> Vec<String> {
        protocol
            .pointer(ptr)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match field {
                        Some(key) => item.get(key).and_then(Value::as_str),
                        None => item.as_str(),
                    })
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let phases = list("/designModule/phases", None);
    Some(Trial {
        title: text(ident, "/briefTitle")
            .or_else(|| text(ident, "/officialTitle"))
            .unwrap_or_else(|| "No title available".to_string()),
        status: text(protocol, "/statusModule/overallStatus").unwrap_or_else(|| "N/A".into()),
        phase: display_phase(&phases),
        study_type: text(protocol, "/designModule/studyType").unwrap_or_else(|| "N/A".into()),
        start_date: format_date(text(protocol, "/statusModule/startDateStruct/date").as_deref()),
        completion_date: format_date(
            text(protocol, "/statusModule/completionDateStruct/date").as_deref(),
        ),
        enrollment: protocol
            .pointer("/designModule/enrollmentInfo/count")
            .and_then(Value::as_u64),
        conditions: list("/conditionsModule/conditions", None),
        interventions: list("/armsInterventionsModule/interventions", Some("name")),
        sponsor: text(protocol, "/sponsorCollaboratorsModule/leadSponsor/name"),
        summary: text(protocol, "/descriptionModule/briefSummary"),
        url: format!("https://clinicaltrials.gov/study/{nct_id}"),
        nct_id,
    })
}

/// `["PHASE2", "PHASE3"]` -> `"Phase 2/Phase 3"`; nothing usable -> `"N/A"`.
fn display_phase(phases: &[String]) -> String {
    let labels: Vec<String> = phases
        .iter()
        .filter(|p| p.to_uppercase() != "NA")
        .map(|p| {
            let upper = p.to_uppercase();
            match upper.strip_prefix("EARLY_PHASE") {
                Some(n) => format!("Early Phase {n}"),
                None => match upper.strip_prefix("PHASE") {
                    Some(n) => format!("Phase {n}"),
                    None => p.clone(),
                },
            }
        })
        .collect();
    if labels.is_empty() {
        "N/A".to_string()
    } else {
        labels.join("/")
    }
}

fn has_phase(phase: &str, number: &str) -> bool {
    let roman = match number {
        "2" => "ii",
        "3" => "iii",
        _ => number,
    };
    phase
        .to_lowercase()
        .split('/')
        .map(str::trim)
        .any(|p| p == format!("phase {number}") || p == format!("phase {roman}"))
}

fn insight(trial: &Trial) -> String {
    let parts: Vec<&str> = [trial.phase.as_str(), trial.status.as_str()]
        .into_iter()
        .filter(|p| *p != "N/A")
        .collect();
    if parts.is_empty() {
        trial.title.clone()
    } else {
        format!("{} ({})", trial.title, parts.join(", "))
    }
}

/// Render registry dates for display: `Mon DD, YYYY`, or `Mon YYYY` when
/// only a month is known. Unparseable input is returned unchanged.
pub(crate) fn format_date(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return "N/A".to_string();
    };
    let day_only = raw.split('T').next().unwrap_or(raw);
    if let Ok(date) = Date::parse(day_only, format_description!("[year]-[month]-[day]")) {
        if let Ok(text) = date.format(format_description!("[month repr:short] [day], [year]")) {
            return text;
        }
    }
    if let Some(text) = month_precision(day_only) {
        return text;
    }
    raw.to_string()
}

fn month_precision(raw: &str) -> Option<String> {
    let (year, month) = raw.split_once('-')?;
    let year: i32 = year.parse().ok()?;
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    let date = Date::from_calendar_date(year, month, 1).ok()?;
    date.format(format_description!("[month repr:short] [year]")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn study(nct: &str, phases: &[&str], status: &str) -> Value {
        json!({
            "protocolSection": {
                "identificationModule": { "nctId": nct, "briefTitle": format!("Study {nct}") },
                "statusModule": {
                    "overallStatus": status,
                    "startDateStruct": { "date": "2023-05-15" },
                    "completionDateStruct": { "date": "2025-01" }
                },
                "designModule": {
                    "phases": phases,
                    "studyType": "INTERVENTIONAL",
                    "enrollmentInfo": { "count": 120 }
                },
                "conditionsModule": { "conditions": ["Type 2 Diabetes"] },
                "armsInterventionsModule": { "interventions": [{ "name": "Metformin" }] },
                "sponsorCollaboratorsModule": { "leadSponsor": { "name": "Acme Pharma" } }
            }
        })
    }

    #[test]
    fn dates_render_by_precision() {
        assert_eq!(format_date(Some("2023-05-15")), "May 15, 2023");
        assert_eq!(format_date(Some("2023-05-15T10:00:00")), "May 15, 2023");
        assert_eq!(format_date(Some("2025-01")), "Jan 2025");
        assert_eq!(format_date(Some("")), "N/A");
        assert_eq!(format_date(None), "N/A");
        assert_eq!(format_date(Some("sometime")), "sometime");
    }

    #[test]
    fn phases_display_and_count() {
        assert_eq!(display_phase(&["PHASE2".into(), "PHASE3".into()]), "Phase 2/Phase 3");
        assert_eq!(display_phase(&["EARLY_PHASE1".into()]), "Early Phase 1");
        assert_eq!(display_phase(&["NA".into()]), "N/A");
        assert!(has_phase("Phase 2/Phase 3", "2"));
        assert!(has_phase("Phase 2/Phase 3", "3"));
        assert!(!has_phase("Phase 1", "2"));
        assert!(has_phase("Phase III", "3"));
    }

    #[test]
    fn summary_counts_phases_and_caps_lists() {
        let mut studies = vec![
            study("NCT001", &["PHASE2"], "RECRUITING"),
            study("NCT002", &["PHASE3"], "COMPLETED"),
            study("NCT003", &["PHASE2", "PHASE3"], "ACTIVE_NOT_RECRUITING"),
            study("NCT004", &[], "WITHDRAWN"),
        ];
        for i in 0..10 {
            studies.push(study(&format!("NCT1{i:02}"), &["PHASE1"], "COMPLETED"));
        }
        let body = json!({ "totalCount": 57, "studies": studies });

        let summary = summarise("metformin", Some("diabetes"), &body).unwrap();
        assert_eq!(summary.total_count, 57);
        assert_eq!(summary.trials.len(), 10);
        assert_eq!(summary.phase_ii, 2);
        assert_eq!(summary.phase_iii, 2);
        assert_eq!(summary.insights.len(), 5);
        assert_eq!(summary.insights[0], "Study NCT001 (Phase 2, RECRUITING)");
        assert_eq!(summary.insights[3], "Study NCT004 (WITHDRAWN)");
        assert_eq!(summary.condition.as_deref(), Some("diabetes"));

        let first = &summary.trials[0];
        assert_eq!(first.start_date, "May 15, 2023");
        assert_eq!(first.completion_date, "Jan 2025");
        assert_eq!(first.enrollment, Some(120));
        assert_eq!(first.interventions, vec!["Metformin"]);
        assert_eq!(first.url, "https://clinicaltrials.gov/study/NCT001");
    }

    #[test]
    fn empty_result_is_none() {
        assert!(summarise("x", None, &json!({ "totalCount": 0, "studies": [] })).is_none());
        assert!(summarise("x", None, &json!({})).is_none());
    }
}
