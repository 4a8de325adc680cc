use serde::{Deserialize, Serialize};

/// A proposed fix (possibly empty) submitted for validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePatch {
    pub vulnerability_id: String,
    #[serde(default)]
    pub patch_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

impl CandidatePatch {
    pub fn new(vulnerability_id: &str, patch_text: Option<&str>) -> Self {
        Self {
            vulnerability_id: vulnerability_id.to_string(),
            patch_text: patch_text.map(str::to_string),
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// An empty patch means "evaluate the unpatched baseline".
    pub fn is_empty(&self) -> bool {
        self.patch_text.as_deref().map_or(true, |t| t.trim().is_empty())
    }
}
