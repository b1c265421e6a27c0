//! RxNav (NLM RxNorm) lookups: identifiers, ATC classes, interactions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SourceClient;
use crate::errors::GenieError;

const SOURCE: &str = "rxnav";
const MAX_CLASSES: usize = 3;
const MAX_INTERACTIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub drug: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrugProfile {
    pub name: String,
    pub rxcui: String,
    pub classes: Vec<String>,
    pub interactions: Vec<Interaction>,
}

#[derive(Clone)]
pub struct RxNavAgent {
    client: SourceClient,
    base: String,
}

impl RxNavAgent {
    pub fn new(client: SourceClient, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn rxcui(&self, name: &str) -> Result<Option<String>, GenieError> {
        let body = self
            .client
            .get_json(
                SOURCE,
                &format!("{}/rxcui.json", self.base),
                &[("name", name.trim().to_string())],
            )
            .await?;
        Ok(body.as_ref().and_then(parse_rxcui))
    }

    pub async fn drug_classes(&self, rxcui: &str) -> Result<Vec<String>, GenieError> {
        let body = self
            .client
            .get_json(
                SOURCE,
                &format!("{}/rxclass/class/byRxcui.json", self.base),
                &[("rxcui", rxcui.to_string()), ("relaSource", "ATC".to_string())],
            )
            .await?;
        Ok(body.as_ref().map(parse_classes).unwrap_or_default())
    }

    pub async fn interactions(&self, rxcui: &str) -> Result<Vec<Interaction>, GenieError> {
        let body = self
            .client
            .get_json(
                SOURCE,
                &format!("{}/interaction/interaction.json", self.base),
                &[("rxcui", rxcui.to_string())],
            )
            .await?;
        Ok(body.as_ref().map(parse_interactions).unwrap_or_default())
    }

    /// Identifier, classes and interactions for `name`; `None` when RxNorm
    /// has no concept for it.
    pub async fn profile(&self, name: &str) -> Result<Option<DrugProfile>, GenieError> {
        let Some(rxcui) = self.rxcui(name).await? else {
            return Ok(None);
        };
        let classes = self.drug_classes(&rxcui).await?;
        let interactions = match self.interactions(&rxcui).await {
            Ok(found) => found,
            Err(err) => {
                log::warn!("interaction lookup for {name} failed: {err}");
                Vec::new()
            }
        };
        Ok(Some(DrugProfile {
            name: name.trim().to_string(),
            rxcui,
            classes,
            interactions,
        }))
    }
}

fn parse_rxcui(body: &Value) -> Option<String> {
    body.pointer("/idGroup/rxnormId/0")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_classes(body: &Value) -> Vec<String> {
    let Some(items) = body
        .pointer("/rxclassDrugInfoList/rxclassDrugInfo")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| item.pointer("/rxclassMinConceptItem/className")?.as_str())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_string()))
        .take(MAX_CLASSES)
        .map(str::to_string)
        .collect()
}

fn parse_interactions(body: &Value) -> Vec<Interaction> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let groups = body
        .get("interactionTypeGroup")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for group in groups {
        let types = group
            .get("interactionType")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for kind in types {
            let pairs = kind
                .get("interactionPair")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for pair in pairs {
                let Some(drug) = pair
                    .pointer("/interactionConcept/1/sourceConceptItem/name")
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                let description = pair
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim();
                if description.is_empty() || !seen.insert(drug.to_lowercase()) {
                    continue;
                }
                found.push(Interaction {
                    drug: drug.to_string(),
                    description: description.to_string(),
                });
                if found.len() == MAX_INTERACTIONS {
                    return found;
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(drug: &str, description: &str) -> Value {
        json!({
            "interactionConcept": [
                { "sourceConceptItem": { "name": "aspirin" } },
                { "sourceConceptItem": { "name": drug } }
            ],
            "description": description
        })
    }

    #[test]
    fn rxcui_is_the_first_identifier() {
        let body = json!({ "idGroup": { "name": "aspirin", "rxnormId": ["1191", "9999"] } });
        assert_eq!(parse_rxcui(&body).as_deref(), Some("1191"));
        assert_eq!(parse_rxcui(&json!({ "idGroup": { "name": "zzz" } })), None);
    }

    #[test]
    fn classes_are_capped_at_three() {
        let info: Vec<Value> = ["Salicylic acid", "Anilides", "Salicylic acid", "Other", "More"]
            .iter()
            .map(|name| json!({ "rxclassMinConceptItem": { "className": name } }))
            .collect();
        let body = json!({ "rxclassDrugInfoList": { "rxclassDrugInfo": info } });
        assert_eq!(parse_classes(&body), vec!["Salicylic acid", "Anilides", "Other"]);
        assert!(parse_classes(&json!({})).is_empty());
    }

    #[test]
    fn interactions_are_deduplicated_and_capped() {
        let mut pairs = vec![
            pair("Warfarin", "Increased bleeding risk."),
            pair("warfarin", "Duplicate entry."),
            pair("Ibuprofen", "  "),
        ];
        for i in 0..15 {
            pairs.push(pair(&format!("Drug {i}"), "Some interaction."));
        }
        let body = json!({
            "interactionTypeGroup": [{ "interactionType": [{ "interactionPair": pairs }] }]
        });
        let found = parse_interactions(&body);
        assert_eq!(found.len(), 10);
        assert_eq!(found[0].drug, "Warfarin");
        assert_eq!(found[0].description, "Increased bleeding risk.");
        assert!(found.iter().all(|i| i.drug != "Ibuprofen"));
    }

    #[tokio::test]
    async fn profile_propagates_unreachable_source() {
        let config = crate::agents::tests::unreachable_config();
        let agent = RxNavAgent::new(SourceClient::new(&config, None).unwrap(), &config.rxnav_base);
        let err = agent.profile("aspirin").await.unwrap_err();
        assert_eq!(err.code(), "SRC-1001");
    }
}
