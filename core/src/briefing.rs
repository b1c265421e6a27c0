//! Per-drug briefings.
//!
//! A briefing queries every data source for one drug, one after another,
//! turns failures into placeholders, asks the chat client for a short
//! narrative and stores the result in `reports`. Summaries are reused when
//! a stored report for the same drug was built from identical source data.

use std::collections::HashSet;
use std::sync::Arc;

use r2d2_sqlite::rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::agents::openfda::TimeWindow;
use crate::agents::pubmed::DEFAULT_MAX_RESULTS;
use crate::agents::{
    Agents, Article, DrugProfile, MolecularInfo, SafetyOverview, SourceOutcome, TrialSummary,
    PLACEHOLDER,
};
use crate::db::{with_conn, DbPool};
use crate::errors::GenieError;
use crate::logging::log_event;
use crate::model_manager::ModelManager;

const BRIEFING_PROMPT: &str = "You are PharmaGenie, a pharmaceutical research assistant. \
Write a concise, factual briefing of at most 200 words from the data provided. \
Cover identity and class, notable interactions, the clinical trial landscape, safety signals and recent literature. \
State plainly where data is missing and never invent figures.";
const SUMMARY_TEMPERATURE: f32 = 0.3;
const SUMMARY_MAX_TOKENS: u32 = 400;

/// Everything the data sources returned for one drug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSources {
    pub identity: SourceOutcome<DrugProfile>,
    pub structure: SourceOutcome<MolecularInfo>,
    pub trials: SourceOutcome<TrialSummary>,
    pub safety: SourceOutcome<SafetyOverview>,
    pub literature: SourceOutcome<Vec<Article>>,
}

impl ReportSources {
    /// Names of the sections whose source could not be reached.
    pub fn unavailable(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.identity.is_unavailable() {
            names.push("identity");
        }
        if self.structure.is_unavailable() {
            names.push("structure");
        }
        if self.trials.is_unavailable() {
            names.push("trials");
        }
        if self.safety.is_unavailable() {
            names.push("safety");
        }
        if self.literature.is_unavailable() {
            names.push("literature");
        }
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrugReport {
    pub id: String,
    pub drug_name: String,
    pub condition: Option<String>,
    pub created_at: i64,
    pub sources: ReportSources,
    pub summary: String,
    pub summary_provider: Option<String>,
    pub summary_model: Option<String>,
    pub source_hash: String,
}

/// Row shape returned by [`Briefing::list`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportListing {
    pub id: String,
    pub drug_name: String,
    pub condition: Option<String>,
    pub provider_id: Option<String>,
    pub model: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRow {
    pub name: String,
    pub trials_total: Option<u64>,
    pub phase_ii: Option<usize>,
    pub phase_iii: Option<usize>,
    pub top_reaction: Option<String>,
    pub interaction_count: Option<usize>,
    pub molecular_weight: Option<f64>,
    /// Sources that could not be reached for this drug.
    pub unavailable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    pub rows: Vec<ComparisonRow>,
    pub insight: String,
}

pub struct Briefing {
    pool: DbPool,
    models: Arc<ModelManager>,
    agents: Agents,
}

impl Briefing {
    pub fn new(pool: DbPool, models: Arc<ModelManager>, agents: Agents) -> Arc<Self> {
        Arc::new(Self {
            pool,
            models,
            agents,
        })
    }

    pub async fn generate(
        &self,
        drug: &str,
        condition: Option<&str>,
    ) -> Result<DrugReport, GenieError> {
        let drug = validate_drug(drug)?;
        let condition = condition
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let sources = self.collect(&drug, condition.as_deref()).await;
        let source_hash = fingerprint(condition.as_deref(), &sources);

        let (summary, provider, model) = match self.reusable_summary(&drug, &source_hash).await? {
            Some(previous) => {
                log::info!("reusing summary from report {} for {drug}", previous.id);
                (
                    previous.summary,
                    previous.summary_provider,
                    previous.summary_model,
                )
            }
            None => self.summarise(&drug, condition.as_deref(), &sources).await,
        };

        let report = DrugReport {
            id: Uuid::new_v4().to_string(),
            drug_name: drug,
            condition,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            sources,
            summary,
            summary_provider: provider,
            summary_model: model,
            source_hash,
        };
        self.persist(&report).await?;
        Ok(report)
    }

    pub async fn fetch(&self, report_id: &str) -> Result<DrugReport, GenieError> {
        let id = report_id.to_string();
        let payload: Option<String> = with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM reports WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await?;
        let payload = payload.ok_or_else(|| GenieError::NotFound(format!("Report '{report_id}'")))?;
        serde_json::from_str(&payload)
            .map_err(|err| GenieError::db(format!("stored report is unreadable: {err}")))
    }

    /// Most recent reports first.
    pub async fn list(&self, limit: usize) -> Result<Vec<ReportListing>, GenieError> {
        let limit = limit.clamp(1, 200) as i64;
        with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, drug_name, condition, provider_id, model, created_at FROM reports
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(ReportListing {
                    id: row.get(0)?,
                    drug_name: row.get(1)?,
                    condition: row.get(2)?,
                    provider_id: row.get(3)?,
                    model: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            let mut listings = Vec::new();
            for row in rows {
                listings.push(row?);
            }
            Ok(listings)
        })
        .await
    }

    /// Side-by-side figures for two or more distinct drugs.
    pub async fn compare(&self, names: &[String]) -> Result<Comparison, GenieError> {
        let mut seen = HashSet::new();
        let names: Vec<String> = names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(n.to_lowercase()))
            .collect();
        if names.len() < 2 {
            return Err(GenieError::InvalidRequest(
                "at least two distinct drugs are required for a comparison".into(),
            ));
        }

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            rows.push(self.comparison_row(name).await);
        }
        let insight = comparison_insight(&rows);
        Ok(Comparison { rows, insight })
    }

    async fn comparison_row(&self, name: String) -> ComparisonRow {
        let mut unavailable = Vec::new();
        let mut note = |section: &str, err: &GenieError| {
            log::warn!("comparison: {section} for {name} unavailable: {err}");
            unavailable.push(section.to_string());
        };

        let trials = match self.agents.trials.search(&name, None).await {
            Ok(found) => Some(found),
            Err(err) => {
                note("trials", &err);
                None
            }
        };
        let top_reaction = match self
            .agents
            .fda
            .reaction_counts(&name, TimeWindow::default(), 1)
            .await
        {
            Ok(counts) => counts.into_iter().next().map(|c| c.term),
            Err(err) => {
                note("safety", &err);
                None
            }
        };
        let interaction_count = match self.agents.rxnav.profile(&name).await {
            Ok(profile) => profile.map(|p| p.interactions.len()),
            Err(err) => {
                note("identity", &err);
                None
            }
        };
        let molecular_weight = match self.agents.pubchem.structure(&name).await {
            Ok(info) => info.and_then(|i| i.properties.molecular_weight),
            Err(err) => {
                note("structure", &err);
                None
            }
        };

        let (trials_total, phase_ii, phase_iii) = match trials {
            Some(Some(summary)) => (
                Some(summary.total_count),
                Some(summary.phase_ii),
                Some(summary.phase_iii),
            ),
            Some(None) => (Some(0), Some(0), Some(0)),
            None => (None, None, None),
        };
        ComparisonRow {
            name,
            trials_total,
            phase_ii,
            phase_iii,
            top_reaction,
            interaction_count,
            molecular_weight,
            unavailable,
        }
    }

    /// Query every source in a fixed order. A failing source never stops
    /// the ones after it.
    async fn collect(&self, drug: &str, condition: Option<&str>) -> ReportSources {
        let identity = SourceOutcome::from_result(self.agents.rxnav.profile(drug).await, drug);
        self.note_degraded("rxnav", drug, &identity).await;

        let structure = SourceOutcome::from_result(self.agents.pubchem.structure(drug).await, drug);
        self.note_degraded("pubchem", drug, &structure).await;

        let trials =
            SourceOutcome::from_result(self.agents.trials.search(drug, condition).await, drug);
        self.note_degraded("clinicaltrials", drug, &trials).await;

        let safety = SourceOutcome::from_result(self.agents.fda.safety_overview(drug).await, drug);
        self.note_degraded("openfda", drug, &safety).await;

        let query = format!("{drug} efficacy safety");
        let literature = SourceOutcome::from_result(
            self.agents
                .pubmed
                .search(&query, DEFAULT_MAX_RESULTS)
                .await
                .map(|articles| Some(articles).filter(|a| !a.is_empty())),
            &query,
        );
        self.note_degraded("pubmed", drug, &literature).await;

        ReportSources {
            identity,
            structure,
            trials,
            safety,
            literature,
        }
    }

    async fn note_degraded<T>(&self, source: &str, drug: &str, outcome: &SourceOutcome<T>) {
        let SourceOutcome::Unavailable { code, message } = outcome else {
            return;
        };
        let module = format!("agents.{source}");
        let data = json!({ "drug": drug, "error_code": code, "error": message });
        let _ = with_conn(&self.pool, move |conn| {
            log_event(
                conn,
                "warn",
                Some("SRC-0503"),
                &module,
                "Data source unavailable",
                Some("Section replaced by a placeholder"),
                Some(data),
            )?;
            Ok(())
        })
        .await;
    }

    async fn reusable_summary(
        &self,
        drug: &str,
        source_hash: &str,
    ) -> Result<Option<DrugReport>, GenieError> {
        let (drug, hash) = (drug.to_string(), source_hash.to_string());
        let payload: Option<String> = with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM reports
                     WHERE lower(drug_name) = lower(?1) AND source_hash = ?2 AND provider_id IS NOT NULL
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![drug, hash],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await?;
        Ok(payload.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    async fn summarise(
        &self,
        drug: &str,
        condition: Option<&str>,
        sources: &ReportSources,
    ) -> (String, Option<String>, Option<String>) {
        let prompt = render_context(drug, condition, sources);
        let outcome = self
            .models
            .complete(
                BRIEFING_PROMPT,
                &prompt,
                Some(SUMMARY_TEMPERATURE),
                Some(SUMMARY_MAX_TOKENS),
            )
            .await;

        let (code, message, data, result) = match outcome {
            Ok(response) if !response.content.trim().is_empty() => (
                "AI-SUMMARY",
                "Briefing summary generated",
                json!({ "drug": drug, "provider": response.provider_id, "model": response.model }),
                (
                    response.content.trim().to_string(),
                    Some(response.provider_id),
                    Some(response.model),
                ),
            ),
            Ok(response) => (
                "AI-SUMMARY-ERR",
                "AI returned empty output",
                json!({ "drug": drug, "provider": response.provider_id }),
                (PLACEHOLDER.to_string(), None, None),
            ),
            Err(err) => (
                "AI-SUMMARY-ERR",
                "Briefing summary unavailable",
                json!({ "drug": drug, "error_code": err.code(), "error": err.to_string() }),
                (PLACEHOLDER.to_string(), None, None),
            ),
        };
        let level = if code == "AI-SUMMARY" { "info" } else { "warn" };
        let _ = with_conn(&self.pool, move |conn| {
            log_event(conn, level, Some(code), "ai.summary", message, None, Some(data))?;
            Ok(())
        })
        .await;
        result
    }

    async fn persist(&self, report: &DrugReport) -> Result<(), GenieError> {
        let payload = serde_json::to_string(report)
            .map_err(|err| GenieError::Unknown(format!("report serialisation failed: {err}")))?;
        let report = report.clone();
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO reports (id, drug_name, condition, payload, source_hash, provider_id, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    report.id,
                    report.drug_name,
                    report.condition,
                    payload,
                    report.source_hash,
                    report.summary_provider,
                    report.summary_model,
                    report.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn validate_drug(drug: &str) -> Result<String, GenieError> {
    let drug = drug.trim();
    if drug.is_empty() {
        return Err(GenieError::InvalidRequest("drug name is required".into()));
    }
    Ok(drug.to_string())
}

/// Hash of the condition and the source data. Failure messages are left out
/// so a repeat of the same outage still matches.
fn fingerprint(condition: Option<&str>, sources: &ReportSources) -> String {
    let mut value = serde_json::to_value(sources).unwrap_or(Value::Null);
    if let Value::Object(sections) = &mut value {
        for section in sections.values_mut() {
            if section.get("status").and_then(Value::as_str) == Some("unavailable") {
                if let Value::Object(fields) = section {
                    fields.remove("message");
                }
            }
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(condition.unwrap_or_default().to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn render_context(drug: &str, condition: Option<&str>, sources: &ReportSources) -> String {
    let mut lines = vec![format!("Drug: {drug}")];
    if let Some(cond) = condition {
        lines.push(format!("Condition of interest: {cond}"));
    }

    match sources.identity.data() {
        Some(profile) => {
            lines.push(format!("RxCUI: {}", profile.rxcui));
            lines.push(format!("Classes: {}", join_or_placeholder(&profile.classes)));
            let interactions: Vec<String> = profile
                .interactions
                .iter()
                .take(5)
                .map(|i| format!("{}: {}", i.drug, i.description))
                .collect();
            lines.push(format!("Interactions: {}", join_or_placeholder(&interactions)));
        }
        None => lines.push(format!("Identity: {PLACEHOLDER}")),
    }

    match sources.structure.data() {
        Some(info) => lines.push(format!(
            "Molecule: {} ({} g/mol)",
            info.properties.molecular_formula.as_deref().unwrap_or("N/A"),
            info.properties
                .molecular_weight
                .map(|w| format!("{w:.2}"))
                .unwrap_or_else(|| "N/A".into())
        )),
        None => lines.push(format!("Molecule: {PLACEHOLDER}")),
    }

    match sources.trials.data() {
        Some(trials) => {
            lines.push(format!(
                "Trials: {} registered, {} phase II and {} phase III among the latest {}",
                trials.total_count,
                trials.phase_ii,
                trials.phase_iii,
                trials.trials.len()
            ));
            for insight in &trials.insights {
                lines.push(format!("- {insight}"));
            }
        }
        None => lines.push(format!("Trials: {PLACEHOLDER}")),
    }

    match sources.safety.data() {
        Some(safety) => {
            let reactions: Vec<String> = safety
                .top_reactions
                .iter()
                .take(5)
                .map(|r| format!("{} ({})", r.term, r.count))
                .collect();
            lines.push(format!("Top reported reactions: {}", join_or_placeholder(&reactions)));
            lines.push(format!("Recalls on record: {}", safety.recalls.len()));
            lines.push(format!("Label indications: {}", truncate(&safety.label.indications_and_usage, 400)));
        }
        None => lines.push(format!("Safety: {PLACEHOLDER}")),
    }

    match sources.literature.data() {
        Some(articles) => {
            for article in articles {
                lines.push(format!("Paper: {} ({}, {})", article.title, article.journal, article.published));
            }
        }
        None => lines.push(format!("Literature: {PLACEHOLDER}")),
    }

    lines.join("\n")
}

fn join_or_placeholder(items: &[String]) -> String {
    if items.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        items.join("; ")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

fn comparison_insight(rows: &[ComparisonRow]) -> String {
    let mut leader: Option<(&str, u64)> = None;
    for row in rows {
        if let Some(total) = row.trials_total.filter(|t| *t > 0) {
            if leader.map_or(true, |(_, best)| total > best) {
                leader = Some((row.name.as_str(), total));
            }
        }
    }
    match leader {
        Some((name, total)) => {
            format!("{name} has the most registered clinical trials ({total}).")
        }
        None => "No registered clinical trials were found for the compared drugs.".to_string(),
    }
}
