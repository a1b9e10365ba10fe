//! Prompt assembly from caller-supplied templates.

use serde::{Deserialize, Serialize};
use tracing::debug;

use demandflow_core::PromptData;

const USER_INPUT: &str = "{user_input}";
const LANGUAGE: &str = "{language}";
const TYPE_TEST: &str = "{type_test}";

/// A fully substituted prompt, ready to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub assistant: Option<String>,
}

impl Prompt {
    /// Substitute placeholders.
    ///
    /// - `{user_input}` in the user template
    /// - `{language}` and `{type_test}` in every template
    ///
    /// Unknown or missing placeholders are left as-is.
    pub fn assemble(data: &PromptData) -> Self {
        let language = data.language();
        let type_test = data.type_test.as_deref().unwrap_or("");

        let common = |template: &str| {
            template
                .replace(LANGUAGE, language)
                .replace(TYPE_TEST, type_test)
        };

        let mut user = common(&data.user);
        match data.user_input.as_deref() {
            Some(input) if user.contains(USER_INPUT) => user = user.replace(USER_INPUT, input),
            Some(_) => debug!("user template has no {USER_INPUT} placeholder; input not inserted"),
            None => {}
        }

        Self {
            system: common(&data.system),
            user,
            assistant: data
                .assistant
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .map(common),
        }
    }
}
