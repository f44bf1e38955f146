//! Artifact cache
//!
//! Each fingerprint owns one slot holding its descriptor state and a
//! compilation lock. A slot moves `Uncompiled -> Compiling -> Ready | Failed`
//! and never back; `Failed` is permanent for that fingerprint in this process.
//!
//! Compiled artifacts are persisted in a bincode envelope next to the configured
//! artifact path, with the fingerprint in the file name so a configuration
//! change never overwrites an earlier artifact.

use crate::fingerprint::{Fingerprint, PLAN_FORMAT_VERSION};
use crate::{EngineError, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use vision_core::CompileWait;

const MAGIC: [u8; 8] = *b"VISNPLAN";

/// A compiled artifact that can be stored and restored
pub trait Artifact: Send + Sync + Sized + 'static {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Lifecycle of one fingerprint's artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Uncompiled,
    Compiling,
    Ready,
    Failed,
}

impl ArtifactStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Ready | ArtifactStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Uncompiled => "uncompiled",
            ArtifactStatus::Compiling => "compiling",
            ArtifactStatus::Ready => "ready",
            ArtifactStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one fingerprint's artifact state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub status: ArtifactStatus,
    /// Cause recorded when the build failed
    pub failure: Option<String>,
}

/// Descriptor plus the artifact itself when Ready
#[derive(Debug)]
pub struct ResolvedArtifact<A> {
    pub descriptor: ArtifactDescriptor,
    pub artifact: Option<Arc<A>>,
}

impl<A> Clone for ResolvedArtifact<A> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            artifact: self.artifact.clone(),
        }
    }
}

impl<A> ResolvedArtifact<A> {
    /// The artifact, only when the descriptor is Ready
    pub fn ready(&self) -> Option<&Arc<A>> {
        match self.descriptor.status {
            ArtifactStatus::Ready => self.artifact.as_ref(),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 8],
    format_version: u32,
    fingerprint: String,
    payload: Vec<u8>,
}

struct SlotState<A> {
    status: ArtifactStatus,
    artifact: Option<Arc<A>>,
    failure: Option<String>,
}

struct Slot<A> {
    fingerprint: Fingerprint,
    path: PathBuf,
    state: RwLock<SlotState<A>>,
    compile_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<A> Slot<A> {
    fn snapshot(&self) -> ResolvedArtifact<A> {
        // A poisoned state lock means a panic mid-transition; report it as failed.
        let (status, artifact, failure) = match self.state.read() {
            Ok(state) => (state.status, state.artifact.clone(), state.failure.clone()),
            Err(_) => (ArtifactStatus::Failed, None, Some("artifact state poisoned".to_string())),
        };
        ResolvedArtifact {
            descriptor: ArtifactDescriptor {
                fingerprint: self.fingerprint.clone(),
                path: self.path.clone(),
                status,
                failure,
            },
            artifact,
        }
    }

    fn transition(&self, status: ArtifactStatus, artifact: Option<Arc<A>>, failure: Option<String>) {
        if let Ok(mut state) = self.state.write() {
            debug!("Artifact {} {} -> {}", self.fingerprint.short(), state.status, status);
            state.status = status;
            state.artifact = artifact;
            state.failure = failure;
        }
    }
}

/// Builds and stores artifacts, at most once per fingerprint
pub struct ArtifactCache<A> {
    artifact_path: PathBuf,
    compile_wait: CompileWait,
    slots: Mutex<HashMap<Fingerprint, Arc<Slot<A>>>>,
}

impl<A: Artifact> ArtifactCache<A> {
    pub fn new(artifact_path: impl Into<PathBuf>, compile_wait: CompileWait) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            compile_wait,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Storage path for a fingerprint: `name.<fp16>.ext` beside the configured path
    pub fn storage_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let stem = self
            .artifact_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let name = match self.artifact_path.extension() {
            Some(ext) => format!("{}.{}.{}", stem, fingerprint.short(), ext.to_string_lossy()),
            None => format!("{}.{}", stem, fingerprint.short()),
        };
        self.artifact_path.with_file_name(name)
    }

    /// Current state for a fingerprint without triggering any work
    pub fn descriptor(&self, fingerprint: &Fingerprint) -> Result<ResolvedArtifact<A>> {
        Ok(self.slot(fingerprint)?.snapshot())
    }

    /// Resolve the artifact for `fingerprint`, building it if needed.
    ///
    /// A stored artifact with a matching envelope is loaded without building.
    /// Otherwise `build_fn` runs at most once per fingerprint on the blocking
    /// pool. A failed build marks the fingerprint Failed and is returned as a
    /// descriptor, not an error.
    ///
    /// The load, build and final transition run on a spawned task holding the
    /// compilation lock, so dropping the calling future never leaves the slot
    /// stuck in Compiling.
    ///
    /// Under [`CompileWait::Degrade`] a caller that finds another caller
    /// compiling returns the in-progress snapshot immediately.
    pub async fn ensure_ready<F>(&self, fingerprint: &Fingerprint, build_fn: F) -> Result<ResolvedArtifact<A>>
    where
        F: FnOnce() -> Result<A> + Send + 'static,
    {
        let slot = self.slot(fingerprint)?;

        let current = slot.snapshot();
        if current.descriptor.status.is_terminal() {
            return Ok(current);
        }

        let guard = match self.compile_wait {
            CompileWait::Block => Arc::clone(&slot.compile_lock).lock_owned().await,
            CompileWait::Degrade => match Arc::clone(&slot.compile_lock).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Artifact {} compiling, degrading caller", fingerprint.short());
                    return Ok(slot.snapshot());
                }
            },
        };

        // Resolved while we waited for the lock.
        let current = slot.snapshot();
        if current.descriptor.status.is_terminal() {
            return Ok(current);
        }

        tokio::spawn(resolve_slot(slot, guard, build_fn))
            .await
            .map_err(|e| EngineError::Artifact(format!("compile task failed: {}", e)))
    }

    /// Delete the stored file for `fingerprint`, if any.
    ///
    /// Only the file is removed; a slot already Ready in this process stays
    /// Ready. Returns whether a file was removed.
    pub fn remove_stored(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let path = self.storage_path(fingerprint);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed stored artifact {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn slot(&self, fingerprint: &Fingerprint) -> Result<Arc<Slot<A>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| EngineError::Artifact("slot table poisoned".to_string()))?;
        let slot = slots.entry(fingerprint.clone()).or_insert_with(|| {
            Arc::new(Slot {
                fingerprint: fingerprint.clone(),
                path: self.storage_path(fingerprint),
                state: RwLock::new(SlotState {
                    status: ArtifactStatus::Uncompiled,
                    artifact: None,
                    failure: None,
                }),
                compile_lock: Arc::new(tokio::sync::Mutex::new(())),
            })
        });
        Ok(Arc::clone(slot))
    }
}

/// Load or build the slot's artifact and move it to a terminal state.
///
/// Holds `_guard` until the transition is recorded.
async fn resolve_slot<A, F>(slot: Arc<Slot<A>>, _guard: OwnedMutexGuard<()>, build_fn: F) -> ResolvedArtifact<A>
where
    A: Artifact,
    F: FnOnce() -> Result<A> + Send + 'static,
{
    let short = slot.fingerprint.short();

    if let Some(artifact) = load_stored(&slot).await {
        info!("Artifact cache hit for {} at {}", short, slot.path.display());
        slot.transition(ArtifactStatus::Ready, Some(Arc::new(artifact)), None);
        return slot.snapshot();
    }

    info!("Artifact cache miss for {}, compiling", short);
    slot.transition(ArtifactStatus::Compiling, None, None);

    let built = match tokio::task::spawn_blocking(build_fn).await {
        Ok(result) => result,
        Err(e) => Err(EngineError::Compilation(format!("build task aborted: {}", e))),
    };

    match built {
        Ok(artifact) => {
            if let Err(e) = persist(&slot, &artifact).await {
                warn!(
                    "Artifact {} built but not persisted to {}: {}",
                    short,
                    slot.path.display(),
                    e
                );
            }
            info!("Artifact {} ready", short);
            slot.transition(ArtifactStatus::Ready, Some(Arc::new(artifact)), None);
        }
        Err(e) => {
            warn!("Artifact {} failed to compile: {}", short, e);
            slot.transition(ArtifactStatus::Failed, None, Some(e.to_string()));
        }
    }

    slot.snapshot()
}

async fn load_stored<A: Artifact>(slot: &Slot<A>) -> Option<A> {
    let path = slot.path.clone();
    let expected = slot.fingerprint.clone();

    let loaded = tokio::task::spawn_blocking(move || read_envelope::<A>(&path, &expected)).await;
    match loaded {
        Ok(Ok(artifact)) => artifact,
        Ok(Err(e)) => {
            warn!("Ignoring unreadable artifact {}: {}", slot.path.display(), e);
            None
        }
        Err(e) => {
            warn!("Artifact load task failed: {}", e);
            None
        }
    }
}

async fn persist<A: Artifact>(slot: &Slot<A>, artifact: &A) -> Result<()> {
    let envelope = Envelope {
        magic: MAGIC,
        format_version: PLAN_FORMAT_VERSION,
        fingerprint: slot.fingerprint.to_string(),
        payload: artifact.encode()?,
    };
    let bytes = bincode::serialize(&envelope)?;
    let path = slot.path.clone();

    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(|e| EngineError::Artifact(format!("persist task failed: {}", e)))?
}

/// Read and check an envelope; `Ok(None)` when absent or built for something else
fn read_envelope<A: Artifact>(path: &Path, expected: &Fingerprint) -> Result<Option<A>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let envelope: Envelope = bincode::deserialize(&bytes)?;
    if envelope.magic != MAGIC {
        return Err(EngineError::Artifact("bad magic".to_string()));
    }
    if envelope.format_version != PLAN_FORMAT_VERSION {
        debug!(
            "Stored artifact has format {} (want {})",
            envelope.format_version, PLAN_FORMAT_VERSION
        );
        return Ok(None);
    }
    if envelope.fingerprint != expected.as_str() {
        debug!("Stored artifact fingerprint {} does not match", envelope.fingerprint);
        return Ok(None);
    }

    A::decode(&envelope.payload).map(Some)
}

/// Write through a temporary sibling and rename into place
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
