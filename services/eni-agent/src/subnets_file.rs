//! The local-subnets file consumed by the CNI plugin.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct SubnetsFileData<'a> {
    aws_subnet_ids: Vec<&'a str>,
}

/// Writes the IDs of the subnets local to this instance's availability zone.
#[derive(Debug, Clone)]
pub struct SubnetsFile {
    path: PathBuf,
}

impl SubnetsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode the sorted subnet IDs.
    pub fn encode<'a>(subnet_ids: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
        let mut ids: Vec<&str> = subnet_ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        // Serializing a list of strings cannot fail.
        serde_json::to_vec(&SubnetsFileData { aws_subnet_ids: ids }).unwrap_or_default()
    }

    /// Write the file unless it already holds the same content.
    ///
    /// Returns true if the file was written.
    pub async fn update<'a>(
        &self,
        subnet_ids: impl IntoIterator<Item = &'a str>,
    ) -> io::Result<bool> {
        let encoded = Self::encode(subnet_ids);
        match tokio::fs::read(&self.path).await {
            Ok(existing) if existing == encoded => {
                debug!(path = %self.path.display(), "Subnets file already up to date");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Failed to read old subnets file, rewriting it"),
        }

        tokio::fs::write(&self.path, &encoded).await?;
        info!(path = %self.path.display(), "Updated subnets file");
        Ok(true)
    }
}
