//! Shape of a generation request as accepted at intake.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::ArtifactId;
use crate::task_type::{ParentRef, TaskType};

/// Language substituted into prompts when the caller does not pick one.
pub const DEFAULT_LANGUAGE: &str = "português";

/// Prompt templates plus the values substituted into them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptData {
    pub system: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant: Option<String>,
    /// Replaces `{user_input}` in the user template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
    /// Replaces `{language}` in every template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Replaces `{type_test}` in every template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_test: Option<String>,
}

impl PromptData {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            assistant: None,
            user_input: None,
            language: None,
            type_test: None,
        }
    }

    pub fn with_user_input(mut self, input: impl Into<String>) -> Self {
        self.user_input = Some(input.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_assistant(mut self, assistant: impl Into<String>) -> Self {
        self.assistant = Some(assistant.into());
        self
    }

    pub fn with_type_test(mut self, type_test: impl Into<String>) -> Self {
        self.type_test = Some(type_test.into());
        self
    }

    pub fn language(&self) -> &str {
        self.language.as_deref().unwrap_or(DEFAULT_LANGUAGE)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.system.trim().is_empty() {
            return Err(DomainError::validation("prompt_data.system must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(DomainError::validation("prompt_data.user must not be empty"));
        }
        Ok(())
    }
}

/// Which provider serves the completion.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    #[serde(alias = "open_ai")]
    OpenAi,
    Gemini,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Gemini => "gemini",
        }
    }
}

impl core::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

/// Sampling configuration forwarded to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, alias = "llm")]
    pub provider: LlmProvider,
    /// Provider default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> DomainResult<()> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(DomainError::validation(format!(
                "llm_config.temperature must be within 0..=1, got {}",
                self.temperature
            )));
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(DomainError::validation(format!(
                    "llm_config.top_p must be within 0..=1, got {top_p}"
                )));
            }
        }
        if self.max_tokens == 0 {
            return Err(DomainError::validation("llm_config.max_tokens must be positive"));
        }
        if matches!(self.model.as_deref(), Some(m) if m.trim().is_empty()) {
            return Err(DomainError::validation("llm_config.model must not be blank"));
        }
        Ok(())
    }
}

/// Opaque identifiers owned by the calling platform.
///
/// Never interpreted here; copied onto artifacts and notifications so the
/// caller can correlate results with its own boards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_board_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
}

impl Correlation {
    pub fn with_work_item_id(mut self, id: impl Into<String>) -> Self {
        self.work_item_id = Some(id.into());
        self
    }

    pub fn with_parent_board_id(mut self, id: impl Into<String>) -> Self {
        self.parent_board_id = Some(id.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_parent_type(mut self, parent_type: impl Into<String>) -> Self {
        self.parent_type = Some(parent_type.into());
        self
    }

    /// Identifiers after a reprocessing run supplied `update`.
    ///
    /// Board ids are replaced when given. The platform is only filled in if
    /// it was never set, and the parent type never changes.
    pub fn revised(&self, update: &Correlation) -> Correlation {
        Correlation {
            work_item_id: update.work_item_id.clone().or_else(|| self.work_item_id.clone()),
            parent_board_id: update
                .parent_board_id
                .clone()
                .or_else(|| self.parent_board_id.clone()),
            platform: self.platform.clone().or_else(|| update.platform.clone()),
            parent_type: self.parent_type.clone(),
        }
    }
}

/// A validated-at-intake request for generated content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub prompt_data: PromptData,
    #[serde(default)]
    pub llm_config: LlmConfig,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl GenerationRequest {
    pub fn new(parent: ParentRef, task_type: TaskType, prompt_data: PromptData) -> Self {
        Self {
            parent,
            task_type,
            prompt_data,
            llm_config: LlmConfig::default(),
            correlation: Correlation::default(),
        }
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.parent.is_blank() {
            return Err(DomainError::validation("parent reference must not be empty"));
        }
        self.prompt_data.validate()?;
        self.llm_config.validate()
    }
}

/// Regenerate an existing artifact in place.
///
/// Parent and task type come from the artifact itself; the caller supplies
/// fresh prompts and may update the board identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprocessRequest {
    pub task_type: TaskType,
    pub artifact_id: ArtifactId,
    pub prompt_data: PromptData,
    #[serde(default)]
    pub llm_config: LlmConfig,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl ReprocessRequest {
    pub fn new(task_type: TaskType, artifact_id: ArtifactId, prompt_data: PromptData) -> Self {
        Self {
            task_type,
            artifact_id,
            prompt_data,
            llm_config: LlmConfig::default(),
            correlation: Correlation::default(),
        }
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.prompt_data.validate()?;
        self.llm_config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            ParentRef::new("EXT-42").unwrap(),
            TaskType::Epic,
            PromptData::new("You write epics.", "Describe: {user_input}").with_user_input("billing"),
        )
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let mut r = request();
        r.prompt_data.user = "  ".into();
        assert!(matches!(r.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn out_of_range_sampling_is_rejected() {
        let mut r = request();
        r.llm_config.temperature = 1.5;
        assert!(r.validate().is_err());

        let mut r = request();
        r.llm_config.top_p = Some(-0.1);
        assert!(r.validate().is_err());
    }

    #[test]
    fn llm_config_defaults_apply_on_deserialize() {
        let cfg: LlmConfig = serde_json::from_value(serde_json::json!({ "llm": "gemini" })).unwrap();
        assert_eq!(cfg.provider, LlmProvider::Gemini);
        assert_eq!(cfg.max_tokens, 1000);
        assert!((cfg.temperature - 0.7).abs() < f32::EPSILON);
        assert!(cfg.model.is_none());
    }

    #[test]
    fn correlation_fields_sit_at_the_top_level() {
        let r = request().with_correlation(
            Correlation::default()
                .with_work_item_id("4711")
                .with_platform("azure"),
        );
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["work_item_id"], "4711");
        assert_eq!(json["platform"], "azure");
        assert!(json.get("parent_board_id").is_none());

        let back: GenerationRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.correlation, r.correlation);
    }

    #[test]
    fn revision_keeps_platform_and_parent_type() {
        let original = Correlation::default()
            .with_work_item_id("1")
            .with_platform("azure")
            .with_parent_type("epic");
        let update = Correlation::default()
            .with_work_item_id("2")
            .with_parent_board_id("board-9")
            .with_platform("jira")
            .with_parent_type("feature");

        let revised = original.revised(&update);
        assert_eq!(revised.work_item_id.as_deref(), Some("2"));
        assert_eq!(revised.parent_board_id.as_deref(), Some("board-9"));
        assert_eq!(revised.platform.as_deref(), Some("azure"));
        assert_eq!(revised.parent_type.as_deref(), Some("epic"));

        let unset = Correlation::default().revised(&update);
        assert_eq!(unset.platform.as_deref(), Some("jira"));
        assert!(unset.parent_type.is_none());
    }

    #[test]
    fn reprocess_request_validates_prompts() {
        let mut r = ReprocessRequest::new(
            TaskType::Feature,
            ArtifactId::new(),
            PromptData::new("system", "rewrite"),
        );
        assert!(r.validate().is_ok());
        r.prompt_data.system.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn language_defaults_to_portuguese() {
        assert_eq!(request().prompt_data.language(), DEFAULT_LANGUAGE);
        assert_eq!(request().prompt_data.with_language("inglês").language(), "inglês");
    }
}
