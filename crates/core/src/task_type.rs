//! Task types and the opaque parent reference.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Kind of work item to generate. Selects the result schema downstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Epic,
    Feature,
    UserStory,
    Task,
    Bug,
    Issue,
    Pbi,
    TestCase,
    Wbs,
    AutomationScript,
}

impl TaskType {
    pub const ALL: [TaskType; 10] = [
        TaskType::Epic,
        TaskType::Feature,
        TaskType::UserStory,
        TaskType::Task,
        TaskType::Bug,
        TaskType::Issue,
        TaskType::Pbi,
        TaskType::TestCase,
        TaskType::Wbs,
        TaskType::AutomationScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Epic => "epic",
            TaskType::Feature => "feature",
            TaskType::UserStory => "user_story",
            TaskType::Task => "task",
            TaskType::Bug => "bug",
            TaskType::Issue => "issue",
            TaskType::Pbi => "pbi",
            TaskType::TestCase => "test_case",
            TaskType::Wbs => "wbs",
            TaskType::AutomationScript => "automation_script",
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown task type: {s}")))
    }
}

/// Caller-supplied reference to the thing a request belongs to.
///
/// Carried through unchanged and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentRef(String);

impl ParentRef {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("parent reference must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl core::fmt::Display for ParentRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
