use super::{read_f64, read_string, read_tags, Refiner};
use crate::llm::extract_json_array;
use crate::models::{CaptureBundle, ExtractedMemory, MemoryType};

const IMPORTANCE: f64 = 0.7;
const MIN_CONFIDENCE: f64 = 0.5;

/// Extracts facts about what the developer is building right now.
pub struct ProjectRefiner;

impl Refiner for ProjectRefiner {
    fn name(&self) -> &'static str {
        "project-extractor"
    }

    fn cooldown_minutes(&self) -> i64 {
        20
    }

    fn system_prompt(&self) -> &'static str {
        "You observe a developer's recent activity and extract facts about \
         the projects they are working on: what the project is, its stack, \
         current goals. Respond with a JSON array only. Each element: \
         {\"fact\": string, \"project\": string, \"confidence\": number 0-1, \
         \"tags\": [string]}. Return [] when nothing is clear."
    }

    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool {
        bundle.screen.len() >= 3 || bundle.files.len() >= 5 || !bundle.comms.is_empty()
    }

    fn format_context(&self, bundle: &CaptureBundle) -> String {
        format!(
            "{}{}{}",
            super::screen_section(bundle),
            super::files_section(bundle),
            super::comms_section(bundle)
        )
    }

    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory> {
        extract_json_array(raw)
            .iter()
            .filter_map(|item| {
                let fact = read_string(item, "fact").or_else(|| read_string(item, "content"))?;
                let confidence = read_f64(item, "confidence", 0.7);
                if confidence < MIN_CONFIDENCE {
                    return None;
                }
                let mut tags = read_tags(item);
                if let Some(project) = read_string(item, "project") {
                    let tag = project.to_lowercase();
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                Some(ExtractedMemory {
                    content: fact,
                    memory_type: MemoryType::Fact,
                    importance: IMPORTANCE,
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
    use crate::models::{new_event_id, CommCapture, CommitMeta};
    use chrono::Utc;

    #[test]
    fn single_commit_is_enough_data() {
        let r = ProjectRefiner;
        let mut bundle = bundle_with(0, 0);
        assert!(!r.has_enough_data(&bundle));
        bundle.comms.push(CommCapture {
            id: new_event_id(),
            timestamp: Utc::now(),
            content: "feat: add search".into(),
            metadata: CommitMeta::default(),
        });
        assert!(r.has_enough_data(&bundle));
    }

    #[test]
    fn parse_tags_project_name() {
        let raw = r#"[{"fact": "Signet uses sqlite for memory", "project": "Signet", "confidence": 0.8}]"#;
        let memories = ProjectRefiner.parse_response(raw);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].memory_type, MemoryType::Fact);
        assert_eq!(memories[0].importance, 0.7);
        assert!(memories[0].tags.contains(&"signet".to_string()));
    }

    #[test]
    fn confidence_floor_applies() {
        let raw = r#"[{"fact": "maybe a web app", "confidence": 0.3}]"#;
        assert!(ProjectRefiner.parse_response(raw).is_empty());
    }
}
