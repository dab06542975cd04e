use crate::updater::{check::UpdateInfo, epoch_milli};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("update does not include a download url")]
    MissingUrl,

    #[error("could not download update archive; {0}")]
    Transport(String),

    #[error("download server responded with status {0}")]
    Status(u16),

    #[error("download timed out")]
    Timeout,

    #[error("could not write update archive; {0}")]
    Io(#[from] io::Error),

    #[error("checksum mismatch; expected '{expected}' but computed '{computed}'")]
    ChecksumMismatch { expected: String, computed: String },
}

impl From<reqwest::Error> for DownloadError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return DownloadError::Timeout;
        }

        DownloadError::Transport(value.to_string())
    }
}

/// A downloaded update archive. Only verified artifacts are handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub local_path: PathBuf,

    /// The hex SHA-256 the update feed announced.
    pub declared_checksum: String,

    /// Filled in by verification.
    pub computed_checksum: Option<String>,

    pub verified: bool,
}

impl Artifact {
    pub fn new(local_path: PathBuf, declared_checksum: &str) -> Self {
        Self {
            local_path,
            declared_checksum: declared_checksum.trim().into(),
            computed_checksum: None,
            verified: false,
        }
    }
}

/// Computes the lowercase hex SHA-256 of a file without reading it into memory at once.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    /// Hashes the artifact and compares it to the declared checksum. On mismatch the file is removed and the
    /// artifact stays unverified.
    #[instrument(skip_all, fields(path = %artifact.local_path.display()))]
    pub async fn verify(&self, artifact: &mut Artifact) -> Result<bool, DownloadError> {
        let path = artifact.local_path.clone();

        let computed = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        let matches = !artifact.declared_checksum.is_empty()
            && computed.eq_ignore_ascii_case(&artifact.declared_checksum);

        artifact.computed_checksum = Some(computed.clone());
        artifact.verified = matches;

        if !matches {
            warn!(
                expected = %artifact.declared_checksum,
                computed = %computed,
                "Artifact checksum mismatch; discarding archive"
            );

            if let Err(e) = tokio::fs::remove_file(&artifact.local_path).await {
                error!(error = %e, "Could not remove artifact after checksum mismatch");
            }
        }

        Ok(matches)
    }
}

/// Streams update archives to the updates storage area.
#[derive(Debug, Clone)]
pub struct ArtifactDownloader {
    client: reqwest::Client,
    updates_dir: PathBuf,
    verifier: ArtifactVerifier,
}

impl ArtifactDownloader {
    pub fn new(updates_dir: PathBuf, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            updates_dir,
            verifier: ArtifactVerifier,
        })
    }

    /// Archive location for a given version; the timestamp keeps repeated downloads apart.
    fn archive_path(&self, version: &str) -> PathBuf {
        let version: String = version
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        self.updates_dir
            .join(format!("update-{version}-{}.tar.gz", epoch_milli()))
    }

    /// Downloads the archive to local storage. The returned artifact is not verified yet.
    #[instrument(skip(self), fields(origin = "updater::download"))]
    pub async fn download(
        &self,
        url: &str,
        version: &str,
        declared_checksum: &str,
    ) -> Result<Artifact, DownloadError> {
        if url.trim().is_empty() {
            return Err(DownloadError::MissingUrl);
        }

        tokio::fs::create_dir_all(&self.updates_dir).await?;
        let path = self.archive_path(version);

        if let Err(e) = self.stream_to_file(url, &path).await {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    error!(error = %remove_err, path = %path.display(), "Could not remove partial download");
                }
            }

            return Err(e);
        }

        debug!(path = %path.display(), "Downloaded update archive");

        Ok(Artifact::new(path, declared_checksum))
    }

    async fn stream_to_file(&self, url: &str, path: &Path) -> Result<(), DownloadError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }

        file.flush().await?;

        Ok(())
    }

    pub async fn verify(&self, artifact: &mut Artifact) -> Result<bool, DownloadError> {
        self.verifier.verify(artifact).await
    }

    /// Downloads and verifies the archive an update check announced.
    pub async fn fetch(&self, update: &UpdateInfo) -> Result<Artifact, DownloadError> {
        let version = update.latest_version.as_deref().unwrap_or("unknown");

        let mut artifact = self
            .download(&update.download_url, version, &update.checksum)
            .await?;

        if !self.verify(&mut artifact).await? {
            return Err(DownloadError::ChecksumMismatch {
                expected: artifact.declared_checksum,
                computed: artifact.computed_checksum.unwrap_or_default(),
            });
        }

        info!(version = %version, path = %artifact.local_path.display(), "Update archive downloaded and verified");

        Ok(artifact)
    }
}
