//! Utilities for resolving, downloading and preparing .NET debugging
//! symbols and Source Link metadata for post-mortem analysis of crash
//! dumps.
//!
//! Given a dump that contains instrumented assemblies, [`SymbolPreparer`]
//! derives their commit identity, locates the matching build artifacts on
//! the CI pipeline or the source host's releases, merges the downloaded
//! bundles into a per-`(commit, platform)` layout on disk and derives the
//! debugger commands that load it. [`SourceLinkResolver`] and
//! [`SequencePointResolver`] answer per-frame queries against the
//! downloaded portable PDBs, and [`pdb::patch`] rewrites PDB ids so
//! symbols from a close-but-not-identical build load anyway.
//!
//! ```no_run
//! use dotnet_symbols::{
//!     platform::{Arch, Os, PlatformDescriptor},
//!     SymbolConfig, SymbolPreparer,
//! };
//! # async fn run(
//! #     analyzer: &dyn dotnet_symbols::DumpAnalyzer,
//! #     bridge: &mut dyn dotnet_symbols::DebuggerBridge,
//! # ) -> dotnet_symbols::Result<()> {
//! let config = SymbolConfig::from_env(std::path::Path::new("/dumps/session-1"));
//! let mut preparer = SymbolPreparer::new(config)?;
//! let platform = PlatformDescriptor::new(Os::Linux, Arch::X64).with_framework(".NET 6.0");
//! let result = preparer
//!     .prepare_symbols(analyzer, &platform, std::path::Path::new("/dumps/session-1"), bridge, true, false)
//!     .await;
//! println!("{}", result.message);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{FailureKind, Result, SymbolError, SymbolIoError};

pub mod config;
pub use config::{SymbolConfig, SymbolConfigBuilder};

pub mod platform;
pub use platform::{framework_folder, ArtifactKind, PlatformDescriptor};

pub mod identity;
pub use identity::{extract_commit_sha, AssemblyIdentity, ModuleInfo};

pub mod cache;

pub mod merge;
pub use merge::{merge_symbol_archives, MergeResult};

pub mod providers;
pub use providers::{
    AzurePipelinesResolver, BuildRecord, DownloadResult, GitHubReleasesResolver, ReleaseRecord,
};

pub mod pdb;
pub use pdb::{PdbId, PortablePdb, SequencePoint};

pub mod sourcelink;
pub use sourcelink::{SourceLinkMap, SourceLinkResolver, SourceLocation, SourceProvider};

pub mod seqpoints;
pub use seqpoints::SequencePointResolver;

pub mod prepare;
pub use prepare::{
    DebuggerBridge, DumpAnalyzer, FallbackStep, PreparationResult, StepFailure, SymbolPreparer,
};

pub mod utils;
pub use utils::CancelToken;
