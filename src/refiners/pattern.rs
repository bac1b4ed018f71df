use super::{read_f64, read_string, read_tags, Refiner};
use crate::llm::extract_json_array;
use crate::models::{CaptureBundle, ExtractedMemory, MemoryType};

const MIN_CONFIDENCE: f64 = 0.5;

/// Slow-cycle extractor for recurring habits across a whole day of activity.
pub struct PatternRefiner;

fn importance_for_strength(strength: &str) -> Option<f64> {
    match strength {
        "moderate" => Some(0.6),
        "strong" => Some(0.85),
        _ => None,
    }
}

impl Refiner for PatternRefiner {
    fn name(&self) -> &'static str {
        "pattern-extractor"
    }

    fn cooldown_minutes(&self) -> i64 {
        720
    }

    fn system_prompt(&self) -> &'static str {
        "You observe a full day of a developer's activity and extract \
         recurring behavioral patterns: habits, preferences, rhythms. \
         Respond with a JSON array only. Each element: {\"pattern\": string, \
         \"strength\": one of \"weak\"|\"moderate\"|\"strong\", \
         \"confidence\": number 0-1, \"tags\": [string]}. Only report \
         patterns with multiple occurrences. Return [] otherwise."
    }

    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool {
        bundle.total() >= 30
    }

    fn format_context(&self, bundle: &CaptureBundle) -> String {
        format!(
            "{}{}{}{}{}",
            super::screen_section(bundle),
            super::terminal_section(bundle),
            super::files_section(bundle),
            super::comms_section(bundle),
            super::voice_section(bundle)
        )
    }

    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory> {
        extract_json_array(raw)
            .iter()
            .filter_map(|item| {
                let pattern =
                    read_string(item, "pattern").or_else(|| read_string(item, "content"))?;
                // weak patterns never persist
                let strength = read_string(item, "strength")?;
                let importance = importance_for_strength(&strength)?;
                let confidence = read_f64(item, "confidence", 0.6);
                if confidence < MIN_CONFIDENCE {
                    return None;
                }
                Some(ExtractedMemory {
                    content: pattern,
                    memory_type: MemoryType::Pattern,
                    importance,
                    confidence,
                    tags: read_tags(item),
                    source: self.name().to_string(),
                })
            })
            .collect()
    }
}
