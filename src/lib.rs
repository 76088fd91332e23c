//! # vrt-engine
//!
//! A visual regression testing engine. For each declared scenario it
//! captures browser screenshots under every configured browser/viewport
//! (through an injected [`CaptureWorker`]), compares them pixel-wise and
//! semantically against stored baselines, and emits a structured verdict
//! with confidence.
//!
//! ## Features
//!
//! - **Multi-engine diffing**: an inline perceptual pixel pass plus
//!   odiff, SSIM and perceptual-hash adapters, renormalized into one
//!   unified agreement score
//! - **DOM-aware findings**: an optional DOM snapshot comparator raises
//!   text/layout/style findings the pixel engines cannot see; text
//!   changes are never auto-passed
//! - **Capture orchestration**: engine groups dispatched one at a time,
//!   bounded per-group parallelism, cancellation, failure capture with
//!   stable placeholders
//! - **Scoring & auto-actions**: weighted confidence with AI triage and
//!   category adjustments, verdict buckets, first-match approve/flag/
//!   reject rules
//! - **Cross-compare**: N-way comparison across browser-version pairs
//!   with a per-pair result store and acceptance ledger
//! - **Acceptance history**: atomic ledger writes and P95 auto-derived
//!   tolerance caps per scenario/viewport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vrt_engine::{
//!     AbortSignal, CaptureBatch, CaptureEvent, CaptureWorker, Scenario,
//!     TestJobOptions, VrtConfig, VrtService,
//! };
//!
//! struct MyWorker;
//!
//! #[async_trait::async_trait]
//! impl CaptureWorker for MyWorker {
//!     async fn run_batch(
//!         &self,
//!         batch: CaptureBatch,
//!         events: tokio::sync::mpsc::Sender<CaptureEvent>,
//!         abort: AbortSignal,
//!     ) -> vrt_engine::Result<()> {
//!         // Drive your sandboxed browser here, emitting one event per task.
//!         let _ = (batch, events, abort);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> vrt_engine::Result<()> {
//!     let config = VrtConfig {
//!         scenarios: vec![Scenario::new("home", "https://example.com")],
//!         ..Default::default()
//!     };
//!     let service = VrtService::new(config, Arc::new(MyWorker))?;
//!     let report = service.run_test_job(TestJobOptions::default()).await?;
//!     println!("{} diffs, {} matched", report.diffs, report.matched);
//!     Ok(())
//! }
//! ```

/// Configuration records and validation
pub mod config;

/// Error types and severity classification
pub mod error;

/// Cancellation signal shared across the pipeline
pub mod cancel;

/// Filename schema, sanitization and metadata sidecars
pub mod paths;

/// Image decoding and size reconciliation
pub mod image_ops;

/// Diff engine adapters (pixelmatch, odiff, ssim, phash)
pub mod engines;

/// DOM snapshot arena model
pub mod dom;

/// DOM snapshot diffing and change classification
pub mod dom_diff;

/// Confidence scoring, verdicts and auto-action rules
pub mod score;

/// AI vision triage capability
pub mod vision;

/// Single-pair comparator and the tagged result model
pub mod compare;

/// Pure task planning (defaults merge, grouping, filtering)
pub mod planner;

/// Capture orchestration over injected workers
pub mod orchestrator;

/// Acceptance ledger and auto-threshold caps
pub mod store;

/// Cross-compare engine with per-pair result stores
pub mod cross;

/// Public façade: test jobs, pair compares, cross-compare
pub mod service;

/// Metric handles for embedders
pub mod metrics;


pub use cancel::*;
pub use compare::*;
pub use config::*;
pub use cross::*;
pub use dom::*;
pub use dom_diff::*;
pub use engines::*;
pub use error::*;
pub use image_ops::*;
pub use metrics::*;
pub use orchestrator::*;
pub use paths::*;
pub use planner::*;
pub use score::*;
pub use service::*;
pub use store::*;
pub use vision::*;
