//! Signal pipeline
//!
//! dedupe -> tenant -> channel -> parse -> policy -> risk -> brokers -> commands

pub mod stages;
pub mod worker;

pub use stages::{EquityProvider, Rejection, Verdict};
pub use worker::{Outcome, PipelineDeps, PipelineWorker};
