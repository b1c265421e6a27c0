//! PubChem PUG-REST: compound identifiers and molecular properties.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SourceClient;
use crate::errors::GenieError;

const SOURCE: &str = "pubchem";
const PROPERTIES: &str = "MolecularFormula,MolecularWeight,IUPACName,CanonicalSMILES";
const MAX_SYNONYMS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompoundProperties {
    pub molecular_formula: Option<String>,
    pub molecular_weight: Option<f64>,
    pub iupac_name: Option<String>,
    pub canonical_smiles: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MolecularInfo {
    pub name: String,
    pub cid: u64,
    #[serde(flatten)]
    pub properties: CompoundProperties,
    pub description: Option<String>,
    pub synonyms: Vec<String>,
}

#[derive(Clone)]
pub struct PubChemAgent {
    client: SourceClient,
    base: String,
}

impl PubChemAgent {
    pub fn new(client: SourceClient, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn cid(&self, name: &str) -> Result<Option<u64>, GenieError> {
        let url = format!(
            "{}/compound/name/{}/cids/JSON",
            self.base,
            urlencoding::encode(name.trim())
        );
        let body = self.client.get_json(SOURCE, &url, &[]).await?;
        Ok(body.as_ref().and_then(parse_cid))
    }

    pub async fn properties(&self, cid: u64) -> Result<CompoundProperties, GenieError> {
        let url = format!("{}/compound/cid/{cid}/property/{PROPERTIES}/JSON", self.base);
        let body = self.client.get_json(SOURCE, &url, &[]).await?;
        Ok(body.as_ref().map(parse_properties).unwrap_or_default())
    }

    pub async fn description(&self, cid: u64) -> Result<Option<String>, GenieError> {
        let url = format!("{}/compound/cid/{cid}/description/JSON", self.base);
        let body = self.client.get_json(SOURCE, &url, &[]).await?;
        Ok(body.as_ref().and_then(parse_description))
    }

    pub async fn synonyms(&self, cid: u64) -> Result<Vec<String>, GenieError> {
        let url = format!("{}/compound/cid/{cid}/synonyms/JSON", self.base);
        let body = self.client.get_json(SOURCE, &url, &[]).await?;
        Ok(body.as_ref().map(parse_synonyms).unwrap_or_default())
    }

    /// Molecular record for `name`; `None` when PubChem has no compound.
    /// Description and synonyms are optional extras and never fail the call.
    pub async fn structure(&self, name: &str) -> Result<Option<MolecularInfo>, GenieError> {
        let Some(cid) = self.cid(name).await? else {
            return Ok(None);
        };
        let properties = self.properties(cid).await?;
        let description = self.description(cid).await.unwrap_or_else(|err| {
            log::warn!("pubchem description for cid {cid} failed: {err}");
            None
        });
        let synonyms = self.synonyms(cid).await.unwrap_or_else(|err| {
            log::warn!("pubchem synonyms for cid {cid} failed: {err}");
            Vec::new()
        });
        Ok(Some(MolecularInfo {
            name: name.trim().to_string(),
            cid,
            properties,
            description,
            synonyms,
        }))
    }
}

fn parse_cid(body: &Value) -> Option<u64> {
    body.pointer("/IdentifierList/CID/0").and_then(Value::as_u64)
}

fn parse_properties(body: &Value) -> CompoundProperties {
    let Some(props) = body.pointer("/PropertyTable/Properties/0") else {
        return CompoundProperties::default();
    };
    let text = |key: &str| props.get(key).and_then(Value::as_str).map(str::to_string);
    // PubChem serialises the weight as a string in newer responses
    let molecular_weight = props.get("MolecularWeight").and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    CompoundProperties {
        molecular_formula: text("MolecularFormula"),
        molecular_weight,
        iupac_name: text("IUPACName"),
        canonical_smiles: text("CanonicalSMILES").or_else(|| text("ConnectivitySMILES")),
    }
}

fn parse_description(body: &Value) -> Option<String> {
    body.pointer("/InformationList/Information")?
        .as_array()?
        .iter()
        .find_map(|info| info.get("Description").and_then(Value::as_str))
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

fn parse_synonyms(body: &Value) -> Vec<String> {
    body.pointer("/InformationList/Information/0/Synonym")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .take(MAX_SYNONYMS)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
