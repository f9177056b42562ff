//! Per-competition JSON artifact store: merge, dedup and atomic persistence.

use std::path::{Path, PathBuf};

use scorehaul_core::{CompetitionAggregate, MatchRecord};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scorehaul-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("existing artifact {path} is not a valid match list: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing aggregate for {competition_id}: {source}")]
    Serialize {
        competition_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Write-side failures are worth one more attempt; a corrupt artifact is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub path: PathBuf,
    pub existing: usize,
    pub incoming: usize,
    pub written: usize,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct AggregateStore {
    root: PathBuf,
}

impl AggregateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, competition_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", competition_slug(competition_id)))
    }

    /// Reads the persisted aggregate, `None` when nothing was written yet.
    pub async fn load(&self, competition_id: &str) -> Result<Option<CompetitionAggregate>, StoreError> {
        let path = self.artifact_path(competition_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io("reading artifact", &path, err)),
        };
        let records: Vec<MatchRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;
        Ok(Some(CompetitionAggregate::from_records(competition_id, records)))
    }

    /// Appends `incoming` after `existing` and dedups the union, keeping first occurrences.
    pub fn merge(
        competition_id: &str,
        existing: Option<CompetitionAggregate>,
        incoming: Vec<MatchRecord>,
    ) -> (CompetitionAggregate, usize) {
        let mut aggregate = existing.unwrap_or_else(|| CompetitionAggregate::new(competition_id));
        let dropped = aggregate.extend_unique(incoming);
        (aggregate, dropped)
    }

    /// Writes the aggregate through a temp file in the same directory and renames it over
    /// the artifact, so a crash never leaves a half-written document behind.
    pub async fn persist(&self, aggregate: &CompetitionAggregate) -> Result<PathBuf, StoreError> {
        let path = self.artifact_path(aggregate.competition_id());
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::io("creating artifact directory", &parent, err))?;

        let bytes = serde_json::to_vec_pretty(aggregate.records()).map_err(|source| StoreError::Serialize {
            competition_id: aggregate.competition_id().to_string(),
            source,
        })?;

        let temp_path = parent.join(format!(
            ".{}.{}.tmp",
            competition_slug(aggregate.competition_id()),
            Uuid::new_v4()
        ));

        if let Err(err) = write_temp(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("renaming temp artifact onto", &path, err));
        }

        debug!(path = %path.display(), records = aggregate.len(), "artifact written");
        Ok(path)
    }

    /// Loads, merges and persists. A failed write is retried once before surfacing.
    pub async fn merge_and_persist(
        &self,
        competition_id: &str,
        incoming: Vec<MatchRecord>,
    ) -> Result<PersistOutcome, StoreError> {
        let existing = self.load(competition_id).await?;
        let existing_len = existing.as_ref().map_or(0, CompetitionAggregate::len);
        let incoming_len = incoming.len();
        let (aggregate, duplicates_dropped) = Self::merge(competition_id, existing, incoming);

        let path = match self.persist(&aggregate).await {
            Ok(path) => path,
            Err(err) if err.is_retryable() => {
                warn!(competition = competition_id, error = %err, "artifact write failed, retrying once");
                self.persist(&aggregate).await?
            }
            Err(err) => return Err(err),
        };

        info!(
            competition = competition_id,
            path = %path.display(),
            existing = existing_len,
            incoming = incoming_len,
            written = aggregate.len(),
            duplicates_dropped,
            "competition aggregate persisted"
        );

        Ok(PersistOutcome {
            path,
            existing: existing_len,
            incoming: incoming_len,
            written: aggregate.len(),
            duplicates_dropped,
        })
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|err| StoreError::io("opening temp artifact", temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StoreError::io("writing temp artifact", temp_path, err))?;
    file.flush()
        .await
        .map_err(|err| StoreError::io("flushing temp artifact", temp_path, err))?;
    file.sync_all()
        .await
        .map_err(|err| StoreError::io("syncing temp artifact", temp_path, err))?;
    Ok(())
}

/// Lowercased id with every run of non-alphanumerics collapsed to a single `-`.
pub fn competition_slug(input: &str) -> String {
    let slug = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}
