//! Job and client store.
//!
//! [`JobStore`] is the contract the scheduling loop leases jobs through.
//! [`FileJobStore`] keeps jobs and clients as JSON files in a state directory
//! (`jobs/{id}.json`, `clients/{NAME}.json`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

/// A recording waiting to be encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub custom_parameters: Vec<String>,
    /// Name of the client this job is assigned to
    #[serde(default)]
    pub assigned_client: Option<String>,
    /// Unix timestamp (milliseconds) when job was created.
    #[serde(default)]
    pub created_at: i64,
}

impl Job {
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        subtitle: impl Into<String>,
        custom_parameters: Vec<String>,
        assigned_client: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            name: name.into(),
            subtitle: subtitle.into(),
            custom_parameters,
            assigned_client,
            created_at: current_timestamp_ms(),
        }
    }
}

/// A worker machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Client {
    pub name: String,
    /// `H:MM`, equal start and end means always available
    pub availability_start: String,
    pub availability_end: String,
    pub priority: i32,
    pub online: bool,
    pub maximum_jobs: u32,
}

impl Client {
    /// Defaults for a machine seen for the first time
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            availability_start: "0:00".to_string(),
            availability_end: "0:00".to_string(),
            priority: 0,
            online: false,
            maximum_jobs: 10,
        }
    }
}

/// Hostname the client record of this machine is keyed by.
pub fn machine_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Get current timestamp in milliseconds since Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Persistent job and client storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Oldest job assigned to `client`, without removing it.
    async fn lease_next_job(&self, client: &Client) -> Result<Option<Job>, StoreError>;

    async fn delete_job(&self, id: &str) -> Result<(), StoreError>;

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn sign_in(&self, client: &Client) -> Result<(), StoreError>;

    async fn sign_out(&self, client: &Client) -> Result<(), StoreError>;

    /// Client record for `hostname`, created with defaults when absent.
    async fn client_for_machine(&self, hostname: &str) -> Result<Client, StoreError>;
}

/// JSON file store under a state directory.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    state_dir: PathBuf,
}

impl FileJobStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    fn clients_dir(&self) -> PathBuf {
        self.state_dir.join("clients")
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{}.json", id))
    }

    fn client_path(&self, name: &str) -> PathBuf {
        self.clients_dir()
            .join(format!("{}.json", name.to_uppercase()))
    }

    /// All readable jobs. Files that fail to parse are skipped.
    pub async fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let dir = self.jobs_dir();
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Only process .json files
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Job>(&path).await {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("failed to load job from {}: {}", path.display(), e),
            }
        }
        Ok(jobs)
    }

    async fn save_client(&self, client: &Client) -> Result<(), StoreError> {
        write_json(&self.client_path(&client.name), client).await
    }

    async fn set_online(&self, client: &Client, online: bool) -> Result<(), StoreError> {
        let mut stored = self.client_for_machine(&client.name).await?;
        stored.online = online;
        self.save_client(&stored).await
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).await?;
    Ok(())
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn lease_next_job(&self, client: &Client) -> Result<Option<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .load_jobs()
            .await?
            .into_iter()
            .filter(|job| {
                job.assigned_client
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(&client.name))
            })
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let job = jobs.into_iter().next();
        if let Some(job) = &job {
            debug!("leased job {} ({})", job.id, job.path.display());
        }
        Ok(job)
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.job_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::JobNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        write_json(&self.job_path(&job.id), job).await
    }

    async fn sign_in(&self, client: &Client) -> Result<(), StoreError> {
        info!("signing in client {}", client.name);
        self.set_online(client, true).await
    }

    async fn sign_out(&self, client: &Client) -> Result<(), StoreError> {
        info!("signing out client {}", client.name);
        self.set_online(client, false).await
    }

    async fn client_for_machine(&self, hostname: &str) -> Result<Client, StoreError> {
        let path = self.client_path(hostname);
        if fs::try_exists(&path).await? {
            return read_json(&path).await;
        }
        info!("creating client record for {}", hostname);
        let client = Client::new(hostname);
        self.save_client(&client).await?;
        Ok(client)
    }
}
