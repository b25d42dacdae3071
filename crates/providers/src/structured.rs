//! Structured (JSON) generation with a single repair pass.
//!
//! Models wrap JSON in prose or code fences, truncate it, or drift from the
//! requested shape. The generator tries each balanced JSON span in the reply
//! until one deserializes. If that fails it sends exactly one repair
//! request that shows the model its own output and the parse error. A second
//! failure surfaces as [`CapabilityError::Validation`].

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};
use waymark_core::error::CapabilityError;
use waymark_core::provider::{GenerateRequest, LanguageModel};

pub struct StructuredGenerator {
    model: Arc<dyn LanguageModel>,
}

impl StructuredGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Generate and parse a `T`.
    pub async fn generate<T: DeserializeOwned>(
        &self,
        request: GenerateRequest,
    ) -> Result<T, CapabilityError> {
        let first = self.model.generate(request.clone()).await?;
        let first_error = match parse::<T>(&first.text) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        warn!(
            model = %self.model.name(),
            error = %first_error,
            "Structured output invalid, attempting repair"
        );

        let repair = repair_request(&request, &first.text, &first_error);
        let second = self.model.generate(repair).await?;
        parse::<T>(&second.text).map_err(|e| {
            debug!(output = %second.text, "Repaired output still invalid");
            CapabilityError::Validation(format!(
                "invalid output after repair: {e} (first attempt: {first_error})"
            ))
        })
    }
}

fn repair_request(original: &GenerateRequest, output: &str, error: &str) -> GenerateRequest {
    let prompt = format!(
        "{}\n\nYour previous reply could not be parsed.\n\
         Previous reply:\n{output}\n\nParse error: {error}\n\n\
         Reply again with only the corrected JSON document, no prose and no code fences.",
        original.prompt
    );
    GenerateRequest {
        prompt,
        ..original.clone()
    }
}

fn parse<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let mut first_error = None;
    for candidate in json_candidates(text) {
        match serde_json::from_str(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    Err(first_error.unwrap_or_else(|| "no JSON document found".to_string()))
}

/// Return the first balanced span in `text` that is valid JSON.
///
/// Prose like "see [below]" is balanced but not JSON, so scanning moves on
/// to the next `{` or `[`.
pub fn extract_json(text: &str) -> Option<&str> {
    json_candidates(text)
        .find(|candidate| serde_json::from_str::<serde_json::Value>(candidate).is_ok())
}

/// Every balanced object or array span, in order of its opening bracket.
fn json_candidates(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .filter(|(_, c)| matches!(c, '{' | '['))
        .filter_map(move |(start, _)| balanced_from(text, start))
}

fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
