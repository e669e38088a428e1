//! In-memory collaborators shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::coordination::locks::DistributedLock;
use crate::errors::{Error, Result};
use crate::filter::FilterPolicy;
use crate::jobs::queue::JobList;
use crate::jobs::{Delivery, Job, WorkQueue};
use crate::module::{fmt_mod_ver, RevInfo, VersionBundle, ZipArchive};
use crate::stash::Stasher;
use crate::storage::Backend;
use crate::upstream::Protocol;

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// Upstream serving a fixed set of versions and recording every call.
#[derive(Default)]
pub struct MockUpstream {
    versions: Mutex<HashMap<String, (Bytes, Bytes, Bytes)>>,
    calls: Mutex<Vec<&'static str>>,
    delay: Duration,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn add(&self, module: &str, version: &str, info: &str, go_mod: &str, zip: &str) {
        self.versions.lock().insert(
            fmt_mod_ver(module, version),
            (
                Bytes::copy_from_slice(info.as_bytes()),
                Bytes::copy_from_slice(go_mod.as_bytes()),
                Bytes::copy_from_slice(zip.as_bytes()),
            ),
        );
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn version_calls(&self) -> usize {
        self.calls_to("version")
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == name).count()
    }

    async fn enter(&self, name: &'static str) -> Result<()> {
        self.calls.lock().push(name);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    fn lookup(&self, module: &str, version: &str) -> Result<(Bytes, Bytes, Bytes)> {
        self.versions
            .lock()
            .get(&fmt_mod_ver(module, version))
            .cloned()
            .ok_or_else(|| Error::not_found(module, version))
    }
}

#[async_trait::async_trait]
impl Protocol for MockUpstream {
    async fn list(&self, module: &str) -> Result<Vec<String>> {
        self.enter("list").await?;
        let prefix = format!("{module}@");
        let mut versions: Vec<String> = self
            .versions
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        versions.sort();
        Ok(versions)
    }

    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        self.enter("info").await?;
        Ok(self.lookup(module, version)?.0)
    }

    async fn latest(&self, module: &str) -> Result<RevInfo> {
        self.enter("latest").await?;
        let mut versions = self.list_unrecorded(module);
        versions.sort();
        let version = versions
            .pop()
            .ok_or_else(|| Error::NotFound(module.to_string()))?;
        Ok(RevInfo {
            version,
            time: Utc.with_ymd_and_hms(2019, 1, 2, 3, 4, 5).unwrap(),
        })
    }

    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        self.enter("go_mod").await?;
        Ok(self.lookup(module, version)?.1)
    }

    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        self.enter("zip").await?;
        Ok(ZipArchive::from_bytes(self.lookup(module, version)?.2))
    }

    async fn version(&self, module: &str, version: &str) -> Result<VersionBundle> {
        self.enter("version").await?;
        let (info, go_mod, zip) = self.lookup(module, version)?;
        Ok(VersionBundle {
            info,
            go_mod,
            zip: ZipArchive::from_bytes(zip),
        })
    }
}

impl MockUpstream {
    fn list_unrecorded(&self, module: &str) -> Vec<String> {
        let prefix = format!("{module}@");
        self.versions
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Storage whose reads miss and whose saves always fail.
pub struct FailingStorage;

#[async_trait::async_trait]
impl Backend for FailingStorage {
    async fn list(&self, _module: &str) -> Result<Vec<String>> {
        Err(Error::Storage("disk on fire".into()))
    }

    async fn exists(&self, _module: &str, _version: &str) -> Result<bool> {
        Ok(false)
    }

    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        Err(Error::not_found(module, version))
    }

    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        Err(Error::not_found(module, version))
    }

    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        Err(Error::not_found(module, version))
    }

    async fn save(
        &self,
        _module: &str,
        _version: &str,
        _go_mod: Bytes,
        _zip: ZipArchive,
        _info: Bytes,
    ) -> Result<()> {
        Err(Error::Storage("disk on fire".into()))
    }
}

// ---------------------------------------------------------------------------
// Stasher
// ---------------------------------------------------------------------------

/// Stasher that sleeps, counts executions and returns a fixed result.
pub struct ScriptedStasher {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    delay: Duration,
    result: Result<()>,
}

impl ScriptedStasher {
    pub fn new(delay: Duration, result: Result<()>) -> Self {
        Self {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            delay,
            result,
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Stasher for ScriptedStasher {
    async fn stash(&self, _module: &str, _version: &str) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// Fleet lock
// ---------------------------------------------------------------------------

/// Lock whose acquire attempts follow a script.  Once the script runs out
/// every acquire succeeds.  Waits resolve immediately with `released`.
pub struct ScriptedLock {
    acquire_script: Mutex<VecDeque<bool>>,
    released: bool,
    acquires: AtomicUsize,
    waits: AtomicUsize,
    releases: Mutex<Vec<(String, String)>>,
}

impl ScriptedLock {
    pub fn new(acquire_script: impl IntoIterator<Item = bool>, released: bool) -> Self {
        Self {
            acquire_script: Mutex::new(acquire_script.into_iter().collect()),
            released,
            acquires: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> Vec<(String, String)> {
        self.releases.lock().clone()
    }
}

#[async_trait::async_trait]
impl DistributedLock for ScriptedLock {
    async fn acquire(&self, _key: &str, _owner: &str, _ttl_secs: u64) -> anyhow::Result<bool> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(self.acquire_script.lock().pop_front().unwrap_or(true))
    }

    async fn release(&self, key: &str, owner: &str) -> anyhow::Result<()> {
        self.releases.lock().push((key.to_string(), owner.to_string()));
        Ok(())
    }

    async fn wait_released(&self, _key: &str, _timeout: Duration) -> anyhow::Result<bool> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(self.released)
    }
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

/// Queue that records enqueued jobs and can be told to reject them.
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<Job>>,
    reject: AtomicBool,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        let queue = Self::default();
        queue.reject.store(true, Ordering::SeqCst);
        queue
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn take(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

#[async_trait::async_trait]
impl WorkQueue for RecordingQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::Internal("queue unavailable".into()));
        }
        self.jobs.lock().push(job);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let mut jobs = self.jobs.lock();
        if jobs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Delivery::new(jobs.remove(0))))
    }
}

/// In-memory stand-in for the KeyDB lists behind the shared job queue.
#[derive(Default)]
pub struct MemoryLists {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryLists {
    pub fn items(&self, list: &str) -> Vec<String> {
        self.lists
            .lock()
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl JobList for MemoryLists {
    async fn push(&self, list: &str, payload: String) -> Result<()> {
        self.lists.lock().entry(list.to_string()).or_default().push_back(payload);
        Ok(())
    }

    async fn move_head(&self, from: &str, to: &str) -> Result<Option<String>> {
        let mut lists = self.lists.lock();
        let Some(payload) = lists.get_mut(from).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        lists
            .entry(to.to_string())
            .or_default()
            .push_front(payload.clone());
        Ok(Some(payload))
    }

    async fn remove(&self, list: &str, payload: &str) -> Result<()> {
        if let Some(items) = self.lists.lock().get_mut(list) {
            if let Some(pos) = items.iter().position(|p| p == payload) {
                items.remove(pos);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Filter that can be flipped between allow-all and deny-all.
pub struct ToggleFilter {
    allow: AtomicBool,
}

impl ToggleFilter {
    pub fn allow_all() -> Self {
        Self {
            allow: AtomicBool::new(true),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allow: AtomicBool::new(false),
        }
    }

    pub fn set(&self, allow: bool) {
        self.allow.store(allow, Ordering::SeqCst);
    }
}

impl FilterPolicy for ToggleFilter {
    fn should_process(&self, _module: &str) -> bool {
        self.allow.load(Ordering::SeqCst)
    }
}
