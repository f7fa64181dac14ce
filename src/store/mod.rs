//! Durable job/asset store: an in-memory cache fronting an embedded
//! keyspace.
//!
//! All reads are served from the cache. Writes land in the cache and the
//! backing partition synchronously; fsync happens on [`Store::persist`],
//! which the snapshot ticker and terminal job transitions invoke. If the
//! disk write fails the cache remains the source of truth and the next
//! snapshot retries.
//!
//! Lock discipline: the cache map lock is only ever held to look up or
//! insert entries; the per-job mutex guards job mutation; neither is held
//! across partition I/O when walking multiple jobs. Snapshot collects the
//! entry handles first, releases the map lock, then locks each job briefly
//! to copy a stable view before writing.

mod entry;
mod keys;

pub use entry::{JobEntry, JobState, RunTokens};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info, warn};

use crate::error::{ErrorReport, Result, ScrapeError};
use crate::model::{Asset, Job, JobId, JobStatus, Settings, Template};

/// Bumped on every incompatible layout change; migrations run at open.
const SCHEMA_VERSION: u32 = 1;

/// Flush cadence for finished assets during a run.
pub const ASSET_FLUSH_BATCH: usize = 5;

pub struct Store {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    assets: PartitionHandle,
    templates: PartitionHandle,
    settings: PartitionHandle,
    error_logs: PartitionHandle,
    meta: PartitionHandle,

    cache: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    template_cache: RwLock<HashMap<String, Template>>,
    current_settings: RwLock<Settings>,
}

impl Store {
    /// Open or create the store. `initial_settings` seeds the settings row
    /// on first boot only.
    pub fn open<P: AsRef<Path>>(path: P, initial_settings: Settings) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = fjall::Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let assets = keyspace.open_partition("assets", PartitionCreateOptions::default())?;
        let templates = keyspace.open_partition("templates", PartitionCreateOptions::default())?;
        let settings = keyspace.open_partition("settings", PartitionCreateOptions::default())?;
        let error_logs = keyspace.open_partition("error_logs", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;

        let store = Self {
            keyspace,
            jobs,
            assets,
            templates,
            settings,
            error_logs,
            meta,
            cache: RwLock::new(HashMap::new()),
            template_cache: RwLock::new(HashMap::new()),
            current_settings: RwLock::new(initial_settings),
        };

        store.migrate()?;
        store.load_all()?;
        info!("Store opened");
        Ok(store)
    }

    /// Idempotent startup migration keyed on the schema_version row.
    fn migrate(&self) -> Result<()> {
        match self.meta.get(keys::SCHEMA_VERSION_KEY)? {
            Some(raw) => {
                let found: u32 = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if found != SCHEMA_VERSION {
                    info!(found, current = SCHEMA_VERSION, "Migrating store schema");
                    self.meta
                        .insert(keys::SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string())?;
                }
            }
            None => {
                self.meta
                    .insert(keys::SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string())?;
            }
        }
        Ok(())
    }

    /// Populate the caches from disk. Jobs persisted mid-run come back as
    /// `Stopped`; their completed work is intact and they can be restarted.
    fn load_all(&self) -> Result<()> {
        // Assets first, grouped by job, so each entry is built complete.
        let mut assets_by_job: HashMap<String, HashMap<String, Asset>> = HashMap::new();
        for item in self.assets.iter() {
            let (key, value) = item?;
            let Some((job_id, _)) = keys::decode_asset_key(&key) else {
                continue;
            };
            match serde_json::from_slice::<Asset>(&value) {
                Ok(asset) => {
                    assets_by_job
                        .entry(job_id)
                        .or_default()
                        .insert(asset.id.clone(), asset);
                }
                Err(e) => warn!(error = %e, "Skipping undecodable asset row"),
            }
        }

        let mut cache = self.cache.write().expect("cache lock poisoned");
        for item in self.jobs.iter() {
            let (_, value) = item?;
            let mut job: Job = match serde_json::from_slice(&value) {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable job row");
                    continue;
                }
            };
            if job.status.is_active() {
                job.status = JobStatus::Stopped;
            }
            let assets = assets_by_job.remove(&job.id).unwrap_or_default();
            let entry = Arc::new(JobEntry::from_parts(job, assets));
            cache.insert(entry.id.clone(), entry);
        }
        drop(cache);

        let mut template_cache = self
            .template_cache
            .write()
            .expect("template lock poisoned");
        for item in self.templates.iter() {
            let (_, value) = item?;
            match serde_json::from_slice::<Template>(&value) {
                Ok(template) => {
                    template_cache.insert(template.id.clone(), template);
                }
                Err(e) => warn!(error = %e, "Skipping undecodable template row"),
            }
        }
        drop(template_cache);

        if let Some(raw) = self.settings.get(keys::SETTINGS_KEY)? {
            match serde_json::from_slice::<Settings>(&raw) {
                Ok(persisted) => {
                    *self.current_settings.write().expect("settings lock poisoned") = persisted;
                }
                Err(e) => warn!(error = %e, "Persisted settings undecodable, keeping seed"),
            }
        } else {
            let seed = self.settings_snapshot();
            self.settings
                .insert(keys::SETTINGS_KEY, serde_json::to_vec(&seed)?)?;
        }

        Ok(())
    }

    // ---- jobs ----

    pub fn add_job(&self, job: Job) -> Result<Arc<JobEntry>> {
        let encoded = serde_json::to_vec(&job)?;
        let key = keys::encode_job_key(&job.id);
        let entry = Arc::new(JobEntry::new(job));

        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(entry.id.clone(), entry.clone());
        self.jobs.insert(key, encoded)?;
        debug!(job_id = %entry.id, "Job added");
        Ok(entry)
    }

    /// Replace the stored definition of a job. Runtime state (assets,
    /// dedup set, tokens) carries over untouched.
    pub fn update_job(&self, job: Job) -> Result<()> {
        let entry = self
            .get_job(&job.id)
            .ok_or_else(|| ScrapeError::Validation(format!("job {} not found", job.id)))?;

        let encoded = {
            let mut state = entry.lock();
            state.job = job;
            state.job.updated_at = chrono::Utc::now();
            serde_json::to_vec(&state.job)?
        };
        self.jobs.insert(keys::encode_job_key(&entry.id), encoded)?;
        Ok(())
    }

    /// Persist the current in-cache job record.
    pub fn persist_job(&self, entry: &JobEntry) -> Result<()> {
        let job = entry.job_snapshot();
        self.jobs
            .insert(keys::encode_job_key(&job.id), serde_json::to_vec(&job)?)?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.cache
            .read()
            .expect("cache lock poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        let entries: Vec<Arc<JobEntry>> = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut jobs: Vec<Job> = entries.iter().map(|e| e.job_snapshot()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Remove a job and everything keyed under it. The caller is
    /// responsible for stopping a running job first.
    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        let removed = self
            .cache
            .write()
            .expect("cache lock poisoned")
            .remove(job_id)
            .is_some();
        if !removed {
            return Ok(false);
        }

        self.jobs.remove(keys::encode_job_key(job_id))?;
        self.remove_prefix(&self.assets, keys::encode_asset_prefix(job_id))?;
        self.remove_prefix(&self.error_logs, keys::encode_error_prefix(job_id))?;
        debug!(job_id, "Job deleted");
        Ok(true)
    }

    fn remove_prefix(&self, partition: &PartitionHandle, prefix: Vec<u8>) -> Result<()> {
        let mut doomed = Vec::new();
        for item in partition.prefix(&prefix) {
            let (key, _) = item?;
            doomed.push(key);
        }
        for key in doomed {
            partition.remove(key)?;
        }
        Ok(())
    }

    // ---- assets ----

    /// Insert a freshly created asset into the cache and the backing
    /// partition. The dedup insert has already happened under the job lock.
    pub fn record_asset(&self, entry: &JobEntry, asset: Asset) -> Result<()> {
        let key = keys::encode_asset_key(&asset.job_id, &asset.id);
        let encoded = serde_json::to_vec(&asset)?;
        entry.lock().assets.insert(asset.id.clone(), asset);
        entry.mark_dirty();
        self.assets.insert(key, encoded)?;
        Ok(())
    }

    /// Reflect a terminal asset transition (downloaded, failed,
    /// thumbnailed) in cache and partition.
    pub fn update_asset(&self, asset: &Asset) -> Result<()> {
        if let Some(entry) = self.get_job(&asset.job_id) {
            entry
                .lock()
                .assets
                .insert(asset.id.clone(), asset.clone());
            entry.mark_dirty();
        }
        self.assets.insert(
            keys::encode_asset_key(&asset.job_id, &asset.id),
            serde_json::to_vec(asset)?,
        )?;
        Ok(())
    }

    pub fn list_assets(&self, job_id: &str) -> Option<Vec<Asset>> {
        self.get_job(job_id).map(|entry| entry.assets_snapshot())
    }

    /// All assets across jobs, newest job first comes last.
    pub fn list_all_assets(&self) -> Vec<Asset> {
        let entries: Vec<Arc<JobEntry>> = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut all = Vec::new();
        for entry in entries {
            all.extend(entry.assets_snapshot());
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Locate an asset by id alone.
    pub fn find_asset(&self, asset_id: &str) -> Option<(Arc<JobEntry>, Asset)> {
        let entries: Vec<Arc<JobEntry>> = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect();
        for entry in entries {
            let found = entry.lock().assets.get(asset_id).cloned();
            if let Some(asset) = found {
                return Some((entry, asset));
            }
        }
        None
    }

    pub fn delete_asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        let Some((entry, asset)) = self.find_asset(asset_id) else {
            return Ok(None);
        };
        entry.lock().assets.remove(asset_id);
        entry.mark_dirty();
        self.assets
            .remove(keys::encode_asset_key(&asset.job_id, &asset.id))?;
        Ok(Some(asset))
    }

    // ---- settings ----

    pub fn settings_snapshot(&self) -> Settings {
        self.current_settings
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let encoded = serde_json::to_vec(&settings)?;
        *self
            .current_settings
            .write()
            .expect("settings lock poisoned") = settings;
        self.settings.insert(keys::SETTINGS_KEY, encoded)?;
        Ok(())
    }

    // ---- templates ----

    pub fn add_template(&self, template: Template) -> Result<()> {
        let encoded = serde_json::to_vec(&template)?;
        let key = keys::encode_template_key(&template.id);
        self.template_cache
            .write()
            .expect("template lock poisoned")
            .insert(template.id.clone(), template);
        self.templates.insert(key, encoded)?;
        Ok(())
    }

    pub fn get_template(&self, template_id: &str) -> Option<Template> {
        self.template_cache
            .read()
            .expect("template lock poisoned")
            .get(template_id)
            .cloned()
    }

    pub fn list_templates(&self) -> Vec<Template> {
        let mut templates: Vec<Template> = self
            .template_cache
            .read()
            .expect("template lock poisoned")
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        templates
    }

    pub fn delete_template(&self, template_id: &str) -> Result<bool> {
        let removed = self
            .template_cache
            .write()
            .expect("template lock poisoned")
            .remove(template_id)
            .is_some();
        if removed {
            self.templates.remove(keys::encode_template_key(template_id))?;
        }
        Ok(removed)
    }

    // ---- error log ----

    pub fn record_error(&self, report: &ErrorReport) -> Result<()> {
        self.error_logs.insert(
            keys::encode_error_key(&report.job_id, &report.id),
            serde_json::to_vec(report)?,
        )?;
        Ok(())
    }

    pub fn list_errors(&self, job_id: &str) -> Result<Vec<ErrorReport>> {
        let mut reports = Vec::new();
        for item in self.error_logs.prefix(keys::encode_error_prefix(job_id)) {
            let (_, value) = item?;
            match serde_json::from_slice::<ErrorReport>(&value) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "Skipping undecodable error row"),
            }
        }
        Ok(reports)
    }

    // ---- snapshot / lifecycle ----

    /// Flush dirty jobs and their assets, then fsync the keyspace.
    /// Returns the number of jobs flushed.
    pub fn snapshot(&self) -> Result<usize> {
        let entries: Vec<Arc<JobEntry>> = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut flushed = 0;
        for entry in entries {
            if !entry.take_dirty() {
                continue;
            }
            // Copy a stable view under the job lock, write outside it.
            let (job, assets) = {
                let state = entry.lock();
                (state.job.clone(), state.assets.values().cloned().collect::<Vec<_>>())
            };
            if let Err(e) = self.write_job_with_assets(&job, &assets) {
                // Re-mark so the next tick retries; cache stays authoritative.
                entry.mark_dirty();
                warn!(job_id = %job.id, error = %e, "Snapshot write failed");
                continue;
            }
            flushed += 1;
        }

        self.persist()?;
        Ok(flushed)
    }

    fn write_job_with_assets(&self, job: &Job, assets: &[Asset]) -> Result<()> {
        self.jobs
            .insert(keys::encode_job_key(&job.id), serde_json::to_vec(job)?)?;
        for asset in assets {
            self.assets.insert(
                keys::encode_asset_key(&asset.job_id, &asset.id),
                serde_json::to_vec(asset)?,
            )?;
        }
        Ok(())
    }

    /// Fsync all pending writes.
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Drop the in-memory caches and rebuild them from disk. Runtime state
    /// of active jobs is preserved by refusing to evict them.
    pub fn clear_caches(&self) -> Result<()> {
        let active: Vec<Arc<JobEntry>> = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .values()
            .filter(|e| e.job_snapshot().status.is_active())
            .cloned()
            .collect();

        self.snapshot()?;
        {
            let mut cache = self.cache.write().expect("cache lock poisoned");
            cache.clear();
        }
        self.template_cache
            .write()
            .expect("template lock poisoned")
            .clear();
        self.load_all()?;

        // Active runs keep their live entries; disk rows for them are
        // replaced by the originals so token/counter state survives.
        let mut cache = self.cache.write().expect("cache lock poisoned");
        for entry in active {
            cache.insert(entry.id.clone(), entry);
        }
        Ok(())
    }
}
