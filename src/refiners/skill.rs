use super::{read_f64, read_string, read_tags, Refiner};
use crate::llm::extract_json_array;
use crate::models::{CaptureBundle, ExtractedMemory, MemoryType};

const MIN_CONFIDENCE: f64 = 0.6;

/// Extracts demonstrated technical skills from screen and terminal activity.
pub struct SkillRefiner;

fn importance_for_level(level: &str) -> f64 {
    match level {
        "learning" => 0.4,
        "competent" => 0.6,
        "proficient" => 0.8,
        "expert" => 0.95,
        _ => 0.6,
    }
}

impl Refiner for SkillRefiner {
    fn name(&self) -> &'static str {
        "skill-extractor"
    }

    fn cooldown_minutes(&self) -> i64 {
        30
    }

    fn system_prompt(&self) -> &'static str {
        "You observe a developer's recent screen and terminal activity and \
         extract technical skills they demonstrably used. Respond with a JSON \
         array only. Each element: {\"skill\": string, \"level\": one of \
         \"learning\"|\"competent\"|\"proficient\"|\"expert\", \"evidence\": \
         short string, \"confidence\": number 0-1, \"tags\": [string]}. \
         Only include skills with concrete evidence in the data. Return [] \
         when nothing qualifies."
    }

    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool {
        bundle.screen.len() >= 5 || bundle.terminal.len() >= 3
    }

    fn format_context(&self, bundle: &CaptureBundle) -> String {
        format!(
            "{}{}",
            super::screen_section(bundle),
            super::terminal_section(bundle)
        )
    }

    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory> {
        extract_json_array(raw)
            .iter()
            .filter_map(|item| {
                let skill = read_string(item, "skill")?;
                let level = read_string(item, "level").unwrap_or_else(|| "competent".into());
                let confidence = read_f64(item, "confidence", 0.7);
                if confidence < MIN_CONFIDENCE {
                    return None;
                }
                let content = match read_string(item, "evidence") {
                    Some(evidence) => format!("{skill} ({level}): {evidence}"),
                    None => format!("{skill} ({level})"),
                };
                let mut tags = read_tags(item);
                let skill_tag = skill.to_lowercase();
                if !tags.contains(&skill_tag) {
                    tags.push(skill_tag);
                }
                Some(ExtractedMemory {
                    content,
                    memory_type: MemoryType::Skill,
                    importance: importance_for_level(&level),
                    confidence,
                    tags,
                    source: self.name().to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::bundle_with;
    use super::*;

    #[test]
    fn thresholds_follow_screen_or_terminal_counts() {
        let r = SkillRefiner;
        assert!(!r.has_enough_data(&bundle_with(4, 2)));
        assert!(r.has_enough_data(&bundle_with(5, 0)));
        assert!(r.has_enough_data(&bundle_with(0, 3)));
    }

    #[test]
    fn parse_maps_levels_to_importance() {
        let raw = r#"[
            {"skill": "Rust", "level": "expert", "evidence": "async refactor", "confidence": 0.9},
            {"skill": "Docker", "level": "learning", "confidence": 0.7}
        ]"#;
        let memories = SkillRefiner.parse_response(raw);
        assert_eq!(memories.len(), 2);
        assert_eq!(memories[0].importance, 0.95);
        assert_eq!(memories[0].memory_type, MemoryType::Skill);
        assert!(memories[0].content.contains("async refactor"));
        assert_eq!(memories[1].importance, 0.4);
        assert!(memories[1].tags.contains(&"docker".to_string()));
    }

    #[test]
    fn low_confidence_skills_are_dropped() {
        let raw = r#"[{"skill": "Kubernetes", "level": "learning", "confidence": 0.4}]"#;
        assert!(SkillRefiner.parse_response(raw).is_empty());
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(SkillRefiner.parse_response("sorry, no JSON today").is_empty());
    }
}
