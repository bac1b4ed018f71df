use super::{read_f64, read_string, read_tags, Refiner};
use crate::llm::extract_json_array;
use crate::models::{CaptureBundle, ExtractedMemory, MemoryType};

const IMPORTANCE: f64 = 0.75;
const MIN_CONFIDENCE: f64 = 0.5;

/// Extracts engineering decisions and their rationale from commits, commands
/// and on-screen discussion.
pub struct DecisionRefiner;

impl Refiner for DecisionRefiner {
    fn name(&self) -> &'static str {
        "decision-extractor"
    }

    fn cooldown_minutes(&self) -> i64 {
        20
    }

    fn system_prompt(&self) -> &'static str {
        "You observe a developer's recent activity and extract engineering \
         decisions that were made, with their rationale when visible. Respond \
         with a JSON array only. Each element: {\"decision\": string, \
         \"reasoning\": string, \"confidence\": number 0-1, \"tags\": \
         [string]}. A decision is a committed choice, not an open question. \
         Return [] when none were made."
    }

    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool {
        !bundle.comms.is_empty()
            || bundle.terminal.len() >= 3
            || bundle.screen.len() >= 3
            || !bundle.voice.is_empty()
    }

    fn format_context(&self, bundle: &CaptureBundle) -> String {
        format!(
            "{}{}{}{}",
            super::comms_section(bundle),
            super::terminal_section(bundle),
            super::screen_section(bundle),
            super::voice_section(bundle)
        )
    }

    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory> {
        extract_json_array(raw)
            .iter()
            .filter_map(|item| {
                let decision =
                    read_string(item, "decision").or_else(|| read_string(item, "content"))?;
                let confidence = read_f64(item, "confidence", 0.7);
                if confidence < MIN_CONFIDENCE {
                    return None;
                }
                let content = match read_string(item, "reasoning") {
                    Some(reasoning) => format!("{decision} — {reasoning}"),
                    None => decision,
                };
                Some(ExtractedMemory {
                    content,
                    memory_type: MemoryType::Decision,
                    importance: IMPORTANCE,
                    confidence,
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
    use crate::models::{new_event_id, VoiceSegment};
    use chrono::Utc;

    #[test]
    fn voice_alone_satisfies_threshold() {
        let r = DecisionRefiner;
        let mut bundle = bundle_with(2, 2);
        assert!(!r.has_enough_data(&bundle));
        bundle.voice.push(VoiceSegment {
            id: new_event_id(),
            timestamp: Utc::now(),
            duration_seconds: 10.0,
            transcript: "let's go with postgres".into(),
            confidence: 0.9,
            language: "en".into(),
            is_speaking: true,
        });
        assert!(r.has_enough_data(&bundle));
    }

    #[test]
    fn parse_joins_decision_and_reasoning() {
        let raw = r#"[{"decision": "use sqlite-vec", "reasoning": "keeps search local", "confidence": 0.85}]"#;
        let memories = DecisionRefiner.parse_response(raw);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "use sqlite-vec — keeps search local");
        assert_eq!(memories[0].importance, 0.75);
        assert_eq!(memories[0].memory_type, MemoryType::Decision);
    }
}
