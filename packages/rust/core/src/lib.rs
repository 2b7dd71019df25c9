//! Pipeline orchestration and domain logic for IdeaForge.
//!
//! This crate ties compression, synthesis, filtering, scoring and selective
//! validation into a checkpointed batch pipeline (see [`pipeline::Pipeline`]),
//! guarded by a shared [`ledger::BudgetLedger`].

pub mod cancel;
pub mod filter;
pub mod ledger;
pub mod pipeline;
pub mod ranking;
pub mod repair;
pub mod scoring;
pub mod synthesis;
pub mod validation;

pub use cancel::CancelToken;
pub use ledger::BudgetLedger;
pub use pipeline::{
    BatchHandle, BatchJob, BatchReport, Pipeline, PipelineSettings, ProgressReporter,
    SilentProgress,
};
pub use ranking::{IdeaDetail, RankingView};
