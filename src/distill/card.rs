use anyhow::Result;
use serde::Serialize;

use super::profile::{CognitiveProfile, PROFILE_TAG};
use crate::models::EntityType;
use crate::store::MemoryStore;

const CARD_SKILL_LIMIT: usize = 12;

/// A2A-compatible agent card, derived on demand from the profile and the
/// expertise graph. Never persisted unless exported.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub version: String,
    pub protocol: &'static str,
    pub capabilities: CardCapabilities,
    pub skills: Vec<CardSkill>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CardCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CardSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub fn agent_card(store: &MemoryStore, agent_name: &str) -> Result<AgentCard> {
    let profile = load_profile(store)?;

    let mut nodes = store.all_expertise_nodes()?;
    nodes.sort_by(|a, b| b.mentions.cmp(&a.mentions).then(a.name.cmp(&b.name)));

    let skills: Vec<CardSkill> = nodes
        .iter()
        .filter(|n| {
            matches!(
                n.entity_type,
                EntityType::Skill | EntityType::Language | EntityType::Framework | EntityType::Tool
            )
        })
        .take(CARD_SKILL_LIMIT)
        .map(|n| CardSkill {
            id: n.id.clone(),
            name: n.name.clone(),
            description: format!("{} ({} mentions)", n.entity_type.as_str(), n.mentions),
            tags: vec![n.entity_type.as_str().to_string()],
        })
        .collect();

    let description = match &profile {
        Some(p) => format!(
            "Personal agent for a developer with a {} problem-solving approach and {} debugging style.",
            p.problem_solving.approach, p.problem_solving.debugging_style
        ),
        None => "Personal agent; profile not yet distilled.".to_string(),
    };

    Ok(AgentCard {
        name: agent_name.to_string(),
        description,
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: "a2a",
        capabilities: CardCapabilities {
            streaming: false,
            push_notifications: false,
        },
        skills,
    })
}

/// Markdown block harness connectors inject as system context.
pub fn training_context(store: &MemoryStore, agent_name: &str) -> Result<String> {
    let profile = load_profile(store)?;
    let mut out = format!("# {agent_name}\n\n");

    if let Some(p) = &profile {
        out.push_str(&format!(
            "Works {}, debugs via {}. Prefers {} plans, learns {}.\n",
            p.problem_solving.approach,
            p.problem_solving.debugging_style,
            p.preferences.planning_style,
            p.preferences.learning_style,
        ));
        if !p.work_patterns.peak_hours.is_empty() {
            out.push_str(&format!("Most productive hours: {:?}.\n", p.work_patterns.peak_hours));
        }
        if !p.strengths.is_empty() {
            out.push_str(&format!("Strengths: {}.\n", p.strengths.join(", ")));
        }
    } else {
        out.push_str("No cognitive profile distilled yet.\n");
    }

    let mut nodes = store.all_expertise_nodes()?;
    nodes.sort_by(|a, b| b.mentions.cmp(&a.mentions).then(a.name.cmp(&b.name)));
    if !nodes.is_empty() {
        let top: Vec<String> = nodes
            .iter()
            .take(CARD_SKILL_LIMIT)
            .map(|n| n.name.clone())
            .collect();
        out.push_str(&format!("\nWorking knowledge: {}.\n", top.join(", ")));
    }
    Ok(out)
}

fn load_profile(store: &MemoryStore) -> Result<Option<CognitiveProfile>> {
    Ok(store
        .find_system_memory_tagged(PROFILE_TAG)?
        .and_then(|m| serde_json::from_str(&m.content).ok()))
}
