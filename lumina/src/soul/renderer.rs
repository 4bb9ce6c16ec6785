//! System-prompt rendering: a YAML template of named sections (role, style,
//! constraints) with `{variable}` substitution, concatenated with blank lines.

use std::collections::HashMap;

use super::SoulError;

/// Section order enforced regardless of YAML key order; unknown sections
/// render after these, in file order.
const SECTION_ORDER: &[&str] = &["role", "style", "constraints"];

/// Parsed prompt template.
pub struct PromptTemplate {
    sections: Vec<(String, String)>,
}

impl PromptTemplate {
    pub fn parse(yaml: &str) -> Result<Self, SoulError> {
        let mapping: serde_yaml::Mapping =
            serde_yaml::from_str(yaml).map_err(|e| SoulError::Template(e.to_string()))?;
        let mut raw: Vec<(String, String)> = Vec::new();
        for (key, value) in mapping {
            let (Some(key), Some(value)) = (key.as_str(), value.as_str()) else {
                continue;
            };
            raw.push((key.to_string(), value.to_string()));
        }

        let mut sections = Vec::with_capacity(raw.len());
        for name in SECTION_ORDER {
            if let Some(pos) = raw.iter().position(|(k, _)| k == name) {
                sections.push(raw.remove(pos));
            }
        }
        sections.extend(raw);
        Ok(Self { sections })
    }

    /// Renders all sections with `{key}` substitution and joins the non-empty
    /// outputs with blank lines.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let parts: Vec<String> = self
            .sections
            .iter()
            .map(|(_, body)| substitute(body, vars))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        parts.join("\n\n")
    }
}

fn substitute(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
