//! Domain types handed between discovery, prompt building, completion and
//! the orchestrator.
//!
//! ## Key types
//!
//! | Type               | Produced by        | Consumed by              |
//! |--------------------|--------------------|--------------------------|
//! | `WorkItem`         | Discovery          | Orchestrator unit        |
//! | `ExamplePair`      | Example loader     | Prompt builder           |
//! | `PromptBundle`     | Prompt builder     | Estimator, completion    |
//! | `CompletionResult` | Completion client  | Target writer            |

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ── Category ────────────────────────────────────────────────────────────────

/// Source-code role. Each category has its own directory and example pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Services,
    Handlers,
    Dao,
}

impl Category {
    /// Fixed processing order.
    pub const ALL: [Category; 3] = [Category::Services, Category::Handlers, Category::Dao];

    /// Directory name under the project root (and under the examples dir).
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Services => "services",
            Self::Handlers => "handlers",
            Self::Dao => "dao",
        }
    }

    pub fn language(self) -> &'static LanguageProfile {
        // Every category in the target projects is Go.
        &GO
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ── Language profile ────────────────────────────────────────────────────────

/// File-naming and fencing conventions for one source language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageProfile {
    /// Human name used in the role statement.
    pub name: &'static str,
    /// Info string placed after the opening fence.
    pub fence_tag: &'static str,
    pub source_suffix: &'static str,
    pub test_suffix: &'static str,
    /// Generated wiring, helpers and health checks that never get tests.
    pub excluded_suffixes: &'static [&'static str],
}

pub const GO: LanguageProfile = LanguageProfile {
    name: "golang",
    fence_tag: "go",
    source_suffix: ".go",
    test_suffix: "_test.go",
    excluded_suffixes: &[
        "_wire.go",
        "wire_gen.go",
        "utils.go",
        "healthcheck.go",
        "healthcheck_handler.go",
    ],
};

impl LanguageProfile {
    /// `true` if `file_name` is a source file that may receive a generated test.
    pub fn is_candidate_name(&self, file_name: &str) -> bool {
        file_name.ends_with(self.source_suffix)
            && !file_name.ends_with(self.test_suffix)
            && !self
                .excluded_suffixes
                .iter()
                .any(|suffix| file_name.ends_with(suffix))
    }

    /// `foo.go` -> `foo_test.go`. `None` if `file_name` lacks the source suffix.
    pub fn test_file_name(&self, file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(self.source_suffix)?;
        Some(format!("{stem}{}", self.test_suffix))
    }
}

// ── Work item ───────────────────────────────────────────────────────────────

/// One source file destined to receive one generated test file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem {
    pub category: Category,
    pub source: PathBuf,
    pub target: PathBuf,
}

// ── Prompt inputs / outputs ─────────────────────────────────────────────────

/// Worked example for a category: a code file and its hand-written tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamplePair {
    pub code: String,
    pub test: String,
}

/// System and user instructions for a single completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBundle {
    pub system: String,
    pub user: String,
}

impl PromptBundle {
    /// Text fed to the token estimator: both instructions back to back.
    pub fn estimation_text(&self) -> String {
        format!("{}{}", self.system, self.user)
    }
}

// ── Completion result ───────────────────────────────────────────────────────

/// How the final text was obtained from the raw model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// Interior of a complete fenced block.
    Fenced,
    /// A fence was opened but generation stopped before it closed.
    Unterminated,
    /// No fence at all; the raw output is used verbatim.
    Raw,
}

impl fmt::Display for Extraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fenced => write!(f, "fenced"),
            Self::Unterminated => write!(f, "unterminated"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub text: String,
    pub extraction: Extraction,
}

impl CompletionResult {
    pub fn is_fallback(&self) -> bool {
        self.extraction == Extraction::Raw
    }
}
