//! Recast core library.
//!
//! Everything a single target needs on its way from a compilation database
//! entry to a classified Rust crate: the target model, the persisted
//! artifacts each stage produces, and the drivers that produce them. The
//! incremental scheduler and the multi-target orchestrator live in
//! `recast-pipeline` and are built on top of these pieces.

pub mod assemble;
pub mod build;
pub mod cas;
pub mod compdb;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod exec;
pub mod fuzz;
pub mod obs;
pub mod repair;
pub mod symbols;
pub mod target;
pub mod telemetry;
pub mod testvec;
pub mod translate;
pub mod verify;
pub mod workdir;
pub mod wrapper;

pub use build::{BuildArtifact, BuildClassification, BuildStatus, LogState};
pub use cas::fs::FsCasStore;
pub use cas::{CasError, CasStore, Digest};
pub use compdb::{CompilationDatabase, CompileUnit};
pub use config::{CommandSpec, FreshnessMode, PipelineConfig};
pub use diagnostic::{Diagnostic, DiagnosticSource, Diagnostics};
pub use error::{RecastError, Result};
pub use fuzz::{AflBackend, CorpusManager, CoverageMap, FuzzBackend};
pub use obs::TargetSpan;
pub use repair::{RepairCycle, RepairDriver, RepairLog, RepairOutcome, RepairPolicy};
pub use target::{Target, TargetKind};
pub use telemetry::init_tracing;
pub use testvec::{ExpectedOutput, TestVector, VectorOrigin, VectorStore};
pub use translate::{CodeGenerator, CommandGenerator, TranslationArtifact, TranslationStatus};
pub use verify::{CompletionStatus, TestOutcome, TestResult};
pub use workdir::WorkDir;
pub use wrapper::WrapperArtifact;
