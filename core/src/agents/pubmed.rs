//! PubMed literature search through NCBI E-utilities.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SourceClient;
use crate::errors::GenieError;

const SOURCE: &str = "pubmed";
pub const DEFAULT_MAX_RESULTS: u32 = 3;
const MAX_RESULTS_CAP: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Article {
    pub pmid: String,
    pub title: String,
    pub journal: String,
    pub published: String,
    pub authors: Vec<String>,
    pub url: String,
}

#[derive(Clone)]
pub struct PubMedAgent {
    client: SourceClient,
    base: String,
}

impl PubMedAgent {
    pub fn new(client: SourceClient, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Relevance-ordered articles for `query`. An empty hit list is a
    /// successful, empty answer.
    pub async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Article>, GenieError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GenieError::InvalidRequest("literature query is empty".into()));
        }
        let retmax = max_results.clamp(1, MAX_RESULTS_CAP);
        let search = self
            .client
            .get_json(
                SOURCE,
                &format!("{}/esearch.fcgi", self.base),
                &[
                    ("db", "pubmed".to_string()),
                    ("term", query.to_string()),
                    ("retmax", retmax.to_string()),
                    ("sort", "relevance".to_string()),
                    ("retmode", "json".to_string()),
                ],
            )
            .await?;
        let ids = search.as_ref().map(parse_ids).unwrap_or_default();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let summary = self
            .client
            .get_json(
                SOURCE,
                &format!("{}/esummary.fcgi", self.base),
                &[
                    ("db", "pubmed".to_string()),
                    ("id", ids.join(",")),
                    ("retmode", "json".to_string()),
                ],
            )
            .await?;
        Ok(summary
            .as_ref()
            .map(|body| parse_summaries(body, &ids))
            .unwrap_or_default())
    }
}

fn parse_ids(body: &Value) -> Vec<String> {
    body.pointer("/esearchresult/idlist")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Articles in the order esearch ranked them.
fn parse_summaries(body: &Value, ids: &[String]) -> Vec<Article> {
    let Some(result) = body.get("result") else {
        return Vec::new();
    };
    ids.iter()
        .filter_map(|pmid| {
            let doc = result.get(pmid)?;
            let text = |key: &str| doc.get(key).and_then(Value::as_str).unwrap_or_default();
            Some(Article {
                pmid: pmid.clone(),
                title: non_empty(text("title"), "No title"),
                journal: non_empty(text("source"), "N/A"),
                published: text("pubdate").to_string(),
                authors: doc
                    .get("authors")
                    .and_then(Value::as_array)
                    .map(|authors| {
                        authors
                            .iter()
                            .filter_map(|a| a.get("name").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                url: format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/"),
            })
        })
        .collect()
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.trim().to_string()
    }
}
