use super::{read_string, read_tags, Refiner};
use crate::llm::extract_json_array;
use crate::models::{CaptureBundle, ExtractedMemory, MemoryType};

const IMPORTANCE: f64 = 0.5;
/// Context items carry a fixed confidence; the short cooldown keeps them
/// fresh instead.
const CONFIDENCE: f64 = 0.8;

/// Fast-cycle extractor for what the developer is doing right now.
pub struct ContextRefiner;

impl Refiner for ContextRefiner {
    fn name(&self) -> &'static str {
        "context-extractor"
    }

    fn cooldown_minutes(&self) -> i64 {
        10
    }

    fn system_prompt(&self) -> &'static str {
        "You observe a developer's last few minutes of activity and summarize \
         the current working context: active task, focus area, blockers. \
         Respond with a JSON array only. Each element: {\"context\": string, \
         \"tags\": [string]}. Keep each item to one sentence. Return [] if \
         the activity is too sparse to summarize."
    }

    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool {
        bundle.screen.len() >= 2 || bundle.terminal.len() >= 2 || bundle.files.len() >= 3
    }

    fn format_context(&self, bundle: &CaptureBundle) -> String {
        format!(
            "{}{}{}",
            super::screen_section(bundle),
            super::terminal_section(bundle),
            super::files_section(bundle)
        )
    }

    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory> {
        extract_json_array(raw)
            .iter()
            .filter_map(|item| {
                let context =
                    read_string(item, "context").or_else(|| read_string(item, "content"))?;
                Some(ExtractedMemory {
                    content: context,
                    memory_type: MemoryType::Semantic,
                    importance: IMPORTANCE,
                    confidence: CONFIDENCE,
                    tags: read_tags(item),
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
    fn lowest_thresholds_of_the_set() {
        let r = ContextRefiner;
        assert!(!r.has_enough_data(&bundle_with(1, 1)));
        assert!(r.has_enough_data(&bundle_with(2, 0)));
        assert!(r.has_enough_data(&bundle_with(0, 2)));
    }

    #[test]
    fn fixed_confidence_applies() {
        let raw = r#"[{"context": "debugging the fts trigger sync"}]"#;
        let memories = ContextRefiner.parse_response(raw);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].confidence, 0.8);
        assert_eq!(memories[0].importance, 0.5);
        assert_eq!(memories[0].memory_type, MemoryType::Semantic);
    }
}
