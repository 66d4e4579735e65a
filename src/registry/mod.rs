//! Static model registry: display aliases, plan tiers, and capability flags.
//! Pure lookups over a fixed table; no side effects.

use serde::{Deserialize, Serialize};

/// Label shown for a model id the registry does not know.
pub const UNKNOWN_MODEL_ALIAS: &str = "AI Assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Max,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Max => "max",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            "max" => Ok(PlanTier::Max),
            other => Err(format!("Unknown plan tier: {other}")),
        }
    }
}

struct ModelSpec {
    id: &'static str,
    alias: &'static str,
    tier: PlanTier,
    web_search: bool,
    vision: bool,
    wiki_grounding: bool,
}

/// Ordered so that each tier's models are contiguous: iterating up to and
/// including a tier yields exactly that plan's model list.
static MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "meta-llama/llama-3.1-8b-instruct",
        alias: "Llama 3.1 8B",
        tier: PlanTier::Free,
        web_search: false,
        vision: false,
        wiki_grounding: false,
    },
    ModelSpec {
        id: "openai/gpt-4o-mini",
        alias: "GPT-4o mini",
        tier: PlanTier::Free,
        web_search: false,
        vision: true,
        wiki_grounding: false,
    },
    ModelSpec {
        id: "google/gemini-flash-1.5",
        alias: "Gemini 1.5 Flash",
        tier: PlanTier::Free,
        web_search: false,
        vision: true,
        wiki_grounding: true,
    },
    ModelSpec {
        id: "openai/gpt-4o",
        alias: "GPT-4o",
        tier: PlanTier::Pro,
        web_search: true,
        vision: true,
        wiki_grounding: false,
    },
    ModelSpec {
        id: "anthropic/claude-3.5-sonnet",
        alias: "Claude 3.5 Sonnet",
        tier: PlanTier::Pro,
        web_search: false,
        vision: true,
        wiki_grounding: false,
    },
    ModelSpec {
        id: "perplexity/sonar",
        alias: "Sonar",
        tier: PlanTier::Pro,
        web_search: true,
        vision: false,
        wiki_grounding: true,
    },
    ModelSpec {
        id: "anthropic/claude-3-opus",
        alias: "Claude 3 Opus",
        tier: PlanTier::Max,
        web_search: false,
        vision: true,
        wiki_grounding: false,
    },
    ModelSpec {
        id: "openai/o1",
        alias: "o1",
        tier: PlanTier::Max,
        web_search: true,
        vision: true,
        wiki_grounding: false,
    },
];

fn find(model_id: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.id == model_id)
}

/// Display alias for a model id; fails closed to a generic label.
pub fn display_alias(model_id: &str) -> &'static str {
    find(model_id).map(|m| m.alias).unwrap_or(UNKNOWN_MODEL_ALIAS)
}

/// Ordered list of model ids available to a plan. Higher tiers are strict
/// supersets of lower ones.
pub fn models_for_plan(tier: PlanTier) -> Vec<&'static str> {
    MODELS.iter().filter(|m| m.tier <= tier).map(|m| m.id).collect()
}

pub fn is_available(model_id: &str, tier: PlanTier) -> bool {
    find(model_id).is_some_and(|m| m.tier <= tier)
}

pub fn supports_web_search(model_id: &str) -> bool {
    find(model_id).is_some_and(|m| m.web_search)
}

pub fn supports_vision(model_id: &str) -> bool {
    find(model_id).is_some_and(|m| m.vision)
}

pub fn supports_wiki_grounding(model_id: &str) -> bool {
    find(model_id).is_some_and(|m| m.wiki_grounding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_falls_closed_to_generic_alias() {
        assert_eq!(display_alias("nonexistent/model"), UNKNOWN_MODEL_ALIAS);
        assert!(!supports_web_search("nonexistent/model"));
        assert!(!supports_vision("nonexistent/model"));
        assert!(!supports_wiki_grounding("nonexistent/model"));
    }

    #[test]
    fn plan_tiers_are_supersets() {
        let free = models_for_plan(PlanTier::Free);
        let pro = models_for_plan(PlanTier::Pro);
        let max = models_for_plan(PlanTier::Max);

        assert!(!free.is_empty());
        assert!(pro.len() > free.len());
        assert!(max.len() > pro.len());
        assert!(free.iter().all(|m| pro.contains(m)));
        assert!(pro.iter().all(|m| max.contains(m)));
    }

    #[test]
    fn capability_predicates_are_independent() {
        assert!(supports_web_search("openai/gpt-4o"));
        assert!(supports_vision("openai/gpt-4o"));
        assert!(!supports_wiki_grounding("openai/gpt-4o"));

        assert!(supports_wiki_grounding("perplexity/sonar"));
        assert!(!supports_vision("perplexity/sonar"));
    }

    #[test]
    fn plan_tier_parses_case_insensitively() {
        assert_eq!("PRO".parse::<PlanTier>().unwrap(), PlanTier::Pro);
        assert_eq!("free".parse::<PlanTier>().unwrap(), PlanTier::Free);
        assert!("enterprise".parse::<PlanTier>().is_err());
        assert!(PlanTier::Free < PlanTier::Pro);
        assert!(PlanTier::Pro < PlanTier::Max);
    }
}
