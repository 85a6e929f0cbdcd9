//! Symbol providers.
//!
//! Two heterogeneous providers can supply symbols for a commit: the CI
//! pipeline that built it ([`pipeline`]) and the source host's release
//! assets ([`release`]). Both share the streamed-download plumbing and the
//! mutual-prefix commit comparison; the orchestrator drives them in a
//! fixed fallback order.

use crate::{
    config::{SymbolConfig, USER_AGENT},
    error::{Result, SymbolError},
    merge::MergeResult,
    utils::CancelToken,
};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub mod pipeline;
pub mod release;

pub use pipeline::{AzurePipelinesResolver, BuildArtifact, BuildRecord};
pub use release::{GitHubReleasesResolver, ReleaseAsset, ReleaseRecord};

/// Outcome of a provider `download_symbols` call.
#[derive(Debug)]
pub struct DownloadResult {
    /// The `symbols-<suffix>` layout root.
    pub root: PathBuf,
    /// Merge outcome. `None` when the downloaded-symbols index already had
    /// a verified layout and no download ran.
    pub merge: Option<MergeResult>,
    /// Whether the layout was reused from the index.
    pub reused: bool,
}

/// Two commits match when either is a prefix of the other, compared
/// case-insensitively. Dumps embed abbreviated SHAs while providers report
/// full ones.
pub(crate) fn commit_matches(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    !a.is_empty() && !b.is_empty() && (a.starts_with(&b) || b.starts_with(&a))
}

/// Builds the provider HTTP client with the configured timeout. The
/// resolvers can also borrow an externally owned client instead.
pub(crate) fn http_client(config: &SymbolConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

/// Streams an HTTP response body to `dest`, enforcing the artifact size
/// cap and observing cancellation between chunks.
pub(crate) async fn stream_to_file(
    response: reqwest::Response,
    dest: &Path,
    max_size: u64,
    cancel: &CancelToken,
) -> Result<()> {
    if let Some(length) = response.content_length() {
        if length > max_size {
            return Err(SymbolError::ArtifactTooLarge { size: length, limit: max_size });
        }
    }
    let mut file =
        tokio::fs::File::create(dest).await.map_err(|err| SymbolError::io(err, dest))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        cancel.check()?;
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > max_size {
            return Err(SymbolError::ArtifactTooLarge { size: written, limit: max_size });
        }
        file.write_all(&chunk).await.map_err(|err| SymbolError::io(err, dest))?;
    }
    file.flush().await.map_err(|err| SymbolError::io(err, dest))?;
    Ok(())
}
