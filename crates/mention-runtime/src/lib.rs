//! Polling runtime that detects assistant mentions on a GitHub repository
//! and dispatches each one to a local assistant CLI.
//!
//! The runtime is organized as a pipeline: the [`github`] client lists
//! recently updated issues, pull requests, and comments; the
//! [`scanner`] filters them through the mention matcher and the dedup
//! store; the [`dispatch`] loop renders a prompt per mention and runs the
//! assistant subprocess; the [`orchestrator`] drives the whole cycle on
//! cron schedules and owns backups.

pub mod assistant;
pub mod config;
pub mod dispatch;
pub mod github;
pub mod orchestrator;
pub mod prompts;
pub mod scanner;

pub use assistant::{AssistantCliInvoker, AssistantInvoker, AssistantOutcome};
pub use config::{BotConfig, RepoRef};
pub use dispatch::{DispatchReport, MentionDispatcher};
pub use github::{GithubApiClient, HostingApi};
pub use orchestrator::{BotStatus, MentionBot};
pub use prompts::PromptLibrary;
pub use scanner::{MentionEvent, MentionScanner, ScanReport};
