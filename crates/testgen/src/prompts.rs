//! Prompt construction for test generation.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever the template wording
//! changes so generated files can be traced back to the prompt that made them.

use std::path::Path;

use crate::errors::GenerationError;
use crate::types::{Category, ExamplePair, LanguageProfile, PromptBundle};

/// Prompt version. Bump on any template change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Structural constraint added to every request unless configured otherwise.
pub const DEFAULT_CONSTRAINT: &str = "\
It is very important that you copy the iteration over the flagTest array: \
declare the test cases as a slice of structs and run every case in a loop.";

const EXAMPLE_CODE_FILE: &str = "code.go";
const EXAMPLE_TEST_FILE: &str = "test.go";

/// Builds the system/user instruction pair for one candidate file.
///
/// Inputs are embedded verbatim; budget handling belongs to the estimator
/// and the completion client.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    language: &'static LanguageProfile,
    constraint: String,
}

impl PromptBuilder {
    pub fn new(language: &'static LanguageProfile) -> Self {
        Self {
            language,
            constraint: DEFAULT_CONSTRAINT.to_string(),
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = constraint.into();
        self
    }

    pub fn build(&self, example: &ExamplePair, candidate: &str) -> PromptBundle {
        let lang = self.language;
        let system = format!(
            "You are a professional programmer and expert in the {name} language.\n\
             I'm going to give you an example of code and its associated tests.\n\n\
             Example of code:\n{code}\n\n\
             Example of tests for the code:\n{test}\n",
            name = lang.name,
            code = fenced(lang.fence_tag, &example.code),
            test = fenced(lang.fence_tag, &example.test),
        );

        let mut user = String::from("Generate tests for this code, following the example tests.\n");
        if !self.constraint.trim().is_empty() {
            user.push_str(self.constraint.trim());
            user.push('\n');
        }
        user.push('\n');
        user.push_str(&fenced(lang.fence_tag, candidate));
        user.push('\n');

        PromptBundle { system, user }
    }
}

fn fenced(tag: &str, body: &str) -> String {
    let newline = if body.ends_with('\n') { "" } else { "\n" };
    format!("```{tag}\n{body}{newline}```")
}

impl ExamplePair {
    /// Load `<examples_dir>/<category>/code.go` and `test.go`.
    pub async fn load(examples_dir: &Path, category: Category) -> Result<Self, GenerationError> {
        let dir = examples_dir.join(category.dir_name());
        let code_path = dir.join(EXAMPLE_CODE_FILE);
        let test_path = dir.join(EXAMPLE_TEST_FILE);

        let code = tokio::fs::read_to_string(&code_path)
            .await
            .map_err(|e| GenerationError::io(&code_path, e))?;
        let test = tokio::fs::read_to_string(&test_path)
            .await
            .map_err(|e| GenerationError::io(&test_path, e))?;

        Ok(Self { code, test })
    }
}
