//! Per-tenant credential directories.
//!
//! Each tenant owns one directory under the root holding the auth files the
//! connection hands us. The directory name is the hex-encoded tenant id, so
//! any id maps to exactly one directory and back. A directory without
//! `creds.json` is a half-written pairing and is unusable.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use parley_core::{CredentialSet, CredentialUpdate};

const COMPLETE_MARKER: &str = "creds.json";
const TENANT_DIR_PREFIX: &str = "tenant-";

pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.root.join(format!("{TENANT_DIR_PREFIX}{}", hex::encode(tenant_id)))
    }

    /// Stored files for the tenant; empty when nothing is stored.
    pub async fn load(&self, tenant_id: &str) -> io::Result<CredentialSet> {
        let dir = self.tenant_dir(tenant_id);
        let mut files = CredentialSet::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            files.insert(name, fs::read_to_string(entry.path()).await?);
        }

        Ok(files)
    }

    /// Apply changed files. Each file is written to a temporary name first and
    /// renamed into place.
    pub async fn save(&self, tenant_id: &str, update: &CredentialUpdate) -> io::Result<()> {
        let dir = self.tenant_dir(tenant_id);
        fs::create_dir_all(&dir).await?;

        for (name, contents) in update {
            let path = dir.join(safe_name(name));
            match contents {
                Some(contents) => {
                    let tmp = path.with_extension("tmp");
                    fs::write(&tmp, contents).await?;
                    fs::rename(&tmp, &path).await?;
                }
                None => match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                },
            }
        }

        debug!(tenant_id, files = update.len(), "Credentials saved");
        Ok(())
    }

    /// Remove everything stored for the tenant. Missing directories are fine.
    pub async fn wipe(&self, tenant_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.tenant_dir(tenant_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn is_complete(&self, tenant_id: &str) -> bool {
        fs::try_exists(self.tenant_dir(tenant_id).join(COMPLETE_MARKER))
            .await
            .unwrap_or(false)
    }

    /// Tenants with a directory under the root.
    pub async fn list_tenants(&self) -> io::Result<Vec<String>> {
        let mut tenants = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(tenants),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match tenant_from_dir(&name) {
                Some(tenant_id) => tenants.push(tenant_id),
                None => warn!(dir = %name, "Skipping foreign directory in credential root"),
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    /// Delete directories without a complete credential set and return the
    /// tenants whose credentials remain.
    pub async fn clean_broken(&self) -> io::Result<Vec<String>> {
        let mut complete = Vec::new();
        for tenant_id in self.list_tenants().await? {
            if self.is_complete(&tenant_id).await {
                complete.push(tenant_id);
            } else {
                warn!(tenant_id, "Removing incomplete credentials");
                self.wipe(&tenant_id).await?;
            }
        }
        Ok(complete)
    }
}

fn tenant_from_dir(name: &str) -> Option<String> {
    let encoded = name.strip_prefix(TENANT_DIR_PREFIX)?;
    String::from_utf8(hex::decode(encoded).ok()?).ok()
}

/// Keep a file name to a single path component.
fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}
