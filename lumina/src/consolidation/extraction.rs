//! Structured-output prompts and parsing for the dreaming route.

use serde::Deserialize;

use crate::llm::strip_code_fences;
use crate::memory::{FactRecord, NewFact};

/// A fact extracted from the conversation log.
#[derive(Clone, Debug, Deserialize)]
pub struct ExtractedFact {
    pub subject: String,
    pub relation: String,
    pub object: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default = "default_emotion")]
    pub emotion: String,
    #[serde(default)]
    pub context: String,
}

impl ExtractedFact {
    /// Key used by evidence links: `subject|relation|object`.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.subject, self.relation, self.object)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExtractedInsight {
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_weight")]
    pub confidence: f32,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

/// Links one insight label to the fact keys evidencing it.
#[derive(Clone, Debug, Deserialize)]
pub struct EvidenceLink {
    pub insight: String,
    #[serde(default)]
    pub facts: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DreamExtraction {
    #[serde(default)]
    pub facts: Vec<ExtractedFact>,
    #[serde(default)]
    pub insights: Vec<ExtractedInsight>,
    #[serde(default)]
    pub evidence_chain: Vec<EvidenceLink>,
}

fn default_weight() -> f32 {
    0.5
}

fn default_emotion() -> String {
    "neutral".to_string()
}

pub fn parse_extraction(raw: &str) -> Result<DreamExtraction, serde_json::Error> {
    serde_json::from_str(strip_code_fences(raw))
}

/// The fixed structured-output prompt for one distillation cycle.
pub fn dream_prompt(context: &str) -> String {
    format!(
        "You distill raw conversation logs into long-term memory.\n\n\
         Conversation log (chronological):\n{context}\n\n\
         Extract durable knowledge as JSON with exactly these keys:\n\
         - \"facts\": array of {{\"subject\", \"relation\", \"object\", \"weight\" (0..1), \
         \"emotion\", \"context\"}}\n\
         - \"insights\": array of {{\"label\", \"description\", \"confidence\" (0..1), \
         \"weight\" (0..1)}}\n\
         - \"evidence_chain\": array of {{\"insight\": <label>, \"facts\": \
         [<\"subject|relation|object\" keys>]}}\n\n\
         Facts are concrete statements about the user or the world; insights are \
         patterns spanning several facts. Skip small talk. Return only the JSON object."
    )
}

/// Merge prompt for contradictory facts: the LLM returns the consolidated
/// fact set that replaces both originals.
pub fn merge_prompt(new_fact: &NewFact, existing: &[FactRecord]) -> String {
    let existing_lines: Vec<String> = existing
        .iter()
        .map(|record| {
            format!(
                "- {} {} {} (weight {:.2}, context: {})",
                record.subject, record.relation, record.object, record.weight, record.context
            )
        })
        .collect();
    format!(
        "Two memory fragments contradict each other.\n\n\
         NEW FACT: {} {} {} (context: {})\n\n\
         EXISTING FACTS:\n{}\n\n\
         Consolidate these into the smallest accurate set of facts. If the new fact \
         supersedes an old one, keep only the new information; if both hold, merge them.\n\
         Return a JSON array of {{\"subject\", \"relation\", \"object\", \"weight\", \
         \"emotion\", \"context\"}} objects and nothing else.",
        new_fact.subject,
        new_fact.relation,
        new_fact.object,
        new_fact.context,
        existing_lines.join("\n")
    )
}

/// Parses the merge response into replacement facts.
pub fn parse_merged_facts(raw: &str) -> Result<Vec<NewFact>, String> {
    let extracted: Vec<ExtractedFact> =
        serde_json::from_str(strip_code_fences(raw)).map_err(|e| e.to_string())?;
    Ok(extracted
        .into_iter()
        .map(|fact| NewFact {
            subject: fact.subject,
            relation: fact.relation,
            object: fact.object,
            weight: fact.weight,
            emotion: fact.emotion,
            context: fact.context,
        })
        .collect())
}
