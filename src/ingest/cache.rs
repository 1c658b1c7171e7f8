use crate::model::normalizer::{ExcludedTournament, NormalizedTournament};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf}
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

const RAW_DIR: &str = "raw";
const NORMALIZED_DIR: &str = "normalized";
const NORMALIZED_FILE: &str = "tournaments.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error
    },

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source
    }
}

/// The consolidated output of one complete ingest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCorpus {
    pub created_at: DateTime<Utc>,
    pub tournaments: Vec<NormalizedTournament>,
    pub excluded: Vec<ExcludedTournament>
}

/// On-disk cache with two tiers:
///
/// - `raw/{id}.json`: the payload exactly as served. Written once and never expired,
///   since recorded results do not change.
/// - `normalized/tournaments.json`: the full normalized corpus, replaced wholesale.
///
/// Files are written to a temporary name and renamed into place, so a crash never leaves
/// a half-written entry behind.
#[derive(Debug, Clone)]
pub struct TwoTierCache {
    root: PathBuf
}

impl TwoTierCache {
    pub async fn open(root: impl Into<PathBuf>) -> Result<TwoTierCache, CacheError> {
        let cache = TwoTierCache { root: root.into() };

        for dir in [cache.root.join(RAW_DIR), cache.root.join(NORMALIZED_DIR)] {
            fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;
        }

        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_path(&self, tournament_id: i64) -> PathBuf {
        self.root.join(RAW_DIR).join(format!("{}.json", tournament_id))
    }

    pub fn normalized_path(&self) -> PathBuf {
        self.root.join(NORMALIZED_DIR).join(NORMALIZED_FILE)
    }

    /// Proves the cache directory is writable
    pub async fn health_check(&self) -> Result<(), CacheError> {
        let probe = self.root.join(".probe");

        fs::write(&probe, b"ok").await.map_err(io_error(&probe))?;
        fs::remove_file(&probe).await.map_err(io_error(&probe))?;

        Ok(())
    }

    pub async fn get_raw(&self, tournament_id: i64) -> Result<Option<Vec<u8>>, CacheError> {
        read_optional(&self.raw_path(tournament_id)).await
    }

    /// Stores a raw payload unless one is already cached. Returns false if the existing
    /// entry was kept.
    pub async fn put_raw(&self, tournament_id: i64, bytes: &[u8]) -> Result<bool, CacheError> {
        let path = self.raw_path(tournament_id);

        if fs::try_exists(&path).await.map_err(io_error(&path))? {
            debug!(tournament_id, "Raw payload already cached");
            return Ok(false);
        }

        write_atomic(&path, bytes).await?;
        Ok(true)
    }

    /// A corrupt normalized entry is reported and treated as a miss
    pub async fn get_normalized(&self) -> Result<Option<NormalizedCorpus>, CacheError> {
        let path = self.normalized_path();
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(corpus) => Ok(Some(corpus)),
            Err(e) => {
                warn!("Ignoring unreadable normalized cache at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn put_normalized(&self, corpus: &NormalizedCorpus) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(corpus)?;

        write_atomic(&self.normalized_path(), &bytes).await?;
        info!(
            "Normalized cache written ({} tournaments, {} excluded)",
            corpus.tournaments.len(),
            corpus.excluded.len()
        );
        Ok(())
    }

    pub async fn clear_normalized(&self) -> Result<(), CacheError> {
        let path = self.normalized_path();

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Normalized cache cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e))
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension("json.tmp");

    fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).await.map_err(io_error(path))?;

    Ok(())
}
