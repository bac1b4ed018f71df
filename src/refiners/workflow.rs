use super::{read_f64, read_string, read_tags, Refiner};
use crate::llm::extract_json_array;
use crate::models::{CaptureBundle, ExtractedMemory, MemoryType};

const IMPORTANCE: f64 = 0.7;
const MIN_CONFIDENCE: f64 = 0.6;

/// Extracts repeatable command sequences and working procedures.
pub struct WorkflowRefiner;

impl Refiner for WorkflowRefiner {
    fn name(&self) -> &'static str {
        "workflow-extractor"
    }

    fn cooldown_minutes(&self) -> i64 {
        30
    }

    fn system_prompt(&self) -> &'static str {
        "You observe a developer's terminal and screen activity and extract \
         repeatable workflows: sequences of steps they perform to accomplish \
         a task. Respond with a JSON array only. Each element: {\"workflow\": \
         string describing the procedure, \"confidence\": number 0-1, \
         \"tags\": [string]}. Only report sequences that actually appear in \
         the data. Return [] otherwise."
    }

    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool {
        bundle.terminal.len() >= 5 || bundle.screen.len() >= 10
    }

    fn format_context(&self, bundle: &CaptureBundle) -> String {
        format!(
            "{}{}",
            super::terminal_section(bundle),
            super::screen_section(bundle)
        )
    }

    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory> {
        extract_json_array(raw)
            .iter()
            .filter_map(|item| {
                let workflow =
                    read_string(item, "workflow").or_else(|| read_string(item, "content"))?;
                let confidence = read_f64(item, "confidence", 0.7);
                if confidence < MIN_CONFIDENCE {
                    return None;
                }
                Some(ExtractedMemory {
                    content: workflow,
                    memory_type: MemoryType::Procedural,
                    importance: IMPORTANCE,
                    confidence,
                    tags: read_tags(item),
                    source: self.name().to_string(),
                })
            })
            .collect()
    }
}
