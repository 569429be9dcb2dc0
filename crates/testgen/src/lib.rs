//! LLM-driven test generation for table-driven Go services.
//!
//! | Module         | Purpose                                              |
//! |----------------|------------------------------------------------------|
//! | `discovery`    | Find source files that still lack a test file        |
//! | `prompts`      | Build system/user instructions from an example pair  |
//! | `tokens`       | Estimate prompt tokens with the model's tokenizer    |
//! | `completion`   | Stream a chat completion and extract the code block  |
//! | `orchestrator` | Bounded fan-out over all work items, run report      |

pub mod completion;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod orchestrator;
pub mod prompts;
pub mod tokens;
pub mod types;

pub use completion::{CompletionClient, OpenAiCompletionClient};
pub use config::GeneratorConfig;
pub use errors::{ErrorKind, GenerationError};
pub use orchestrator::{Orchestrator, RunReport};
pub use tokens::{HfTokenEstimator, TokenEstimator};
pub use types::{Category, CompletionResult, ExamplePair, Extraction, PromptBundle, WorkItem};
