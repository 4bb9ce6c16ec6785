//! Trait evolution: parse the LLM's trait-update JSON and merge it into the
//! soul profile. Updates are non-destructive; traits are merged, never
//! replaced.

use serde::Deserialize;

use crate::llm::strip_code_fences;

use super::store::{Pad, SoulProfile};

/// Update shape returned by the `evolution` LLM route.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TraitUpdate {
    #[serde(default)]
    pub new_traits: Vec<String>,
    #[serde(default)]
    pub current_mood: Option<String>,
    #[serde(default)]
    pub pad_delta: Option<Pad>,
}

pub fn parse_trait_update(raw: &str) -> Result<TraitUpdate, serde_json::Error> {
    serde_json::from_str(strip_code_fences(raw))
}

/// Applies an update to the profile: traits are unioned (existing order
/// preserved), mood replaced when present, PAD deltas added and clamped to
/// [-1, 1].
pub fn merge_update(profile: &mut SoulProfile, update: TraitUpdate) {
    for new_trait in update.new_traits {
        let new_trait = new_trait.trim().to_string();
        if new_trait.is_empty() {
            continue;
        }
        if !profile
            .personality
            .traits
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&new_trait))
        {
            profile.personality.traits.push(new_trait);
        }
    }
    if let Some(mood) = update.current_mood {
        if !mood.trim().is_empty() {
            profile.current_mood = mood;
        }
    }
    if let Some(delta) = update.pad_delta {
        profile.pad.pleasure = (profile.pad.pleasure + delta.pleasure).clamp(-1.0, 1.0);
        profile.pad.arousal = (profile.pad.arousal + delta.arousal).clamp(-1.0, 1.0);
        profile.pad.dominance = (profile.pad.dominance + delta.dominance).clamp(-1.0, 1.0);
    }
    profile.last_updated = Some(chrono::Utc::now().to_rfc3339());
}

/// Prompt sent to the `evolution` route with recent memories as context.
pub fn evolution_prompt(character_name: &str, memories: &[String]) -> String {
    let memory_block = if memories.is_empty() {
        "(no recent memories)".to_string()
    } else {
        memories
            .iter()
            .map(|m| format!("- {m}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "You maintain the evolving personality of the AI companion \"{character_name}\".\n\
         Recent episodic memories:\n{memory_block}\n\n\
         Based on these, return a JSON object with:\n\
         - \"new_traits\": array of short trait strings to add (may be empty)\n\
         - \"current_mood\": one word describing the present mood\n\
         - \"pad_delta\": optional object with \"pleasure\", \"arousal\", \"dominance\" \
         floats in [-0.2, 0.2]\n\n\
         Return only the JSON object."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_traits_case_insensitively() {
        let mut profile = SoulProfile::default();
        profile.personality.traits = vec!["curious".to_string()];

        merge_update(
            &mut profile,
            TraitUpdate {
                new_traits: vec!["Curious".to_string(), "playful".to_string()],
                current_mood: Some("cheerful".to_string()),
                pad_delta: None,
            },
        );

        assert_eq!(profile.personality.traits, vec!["curious", "playful"]);
        assert_eq!(profile.current_mood, "cheerful");
        assert!(profile.last_updated.is_some());
    }

    #[test]
    fn pad_delta_is_clamped() {
        let mut profile = SoulProfile::default();
        profile.pad.arousal = 0.9;
        merge_update(
            &mut profile,
            TraitUpdate {
                new_traits: vec![],
                current_mood: None,
                pad_delta: Some(Pad {
                    pleasure: -3.0,
                    arousal: 0.5,
                    dominance: 0.0,
                }),
            },
        );
        assert_eq!(profile.pad.pleasure, -1.0);
        assert_eq!(profile.pad.arousal, 1.0);
    }

    #[test]
    fn parses_fenced_json() {
        let update =
            parse_trait_update("```json\n{\"new_traits\": [\"warm\"], \"current_mood\": \"calm\"}\n```")
                .unwrap();
        assert_eq!(update.new_traits, vec!["warm"]);
        assert_eq!(update.current_mood.as_deref(), Some("calm"));
    }
}
