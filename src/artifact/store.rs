//! Content-addressed, append-only artifact persistence.
//!
//! Layout: `<root>/objects/<first two hex chars>/<id>.json`. Objects are
//! written to `<root>/tmp` and renamed into place, and an existing object is
//! never overwritten, so concurrent writers need no coordination.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};

use super::{Artifact, ArtifactKind, ArtifactPayload};
use crate::error::{PipelineError, Result};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{now_ms, ArtifactId, InvocationId};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn content_hash(payload: &ArtifactPayload) -> Result<String> {
    Ok(sha256_hex(&serde_json::to_vec(payload)?))
}

fn envelope_id(
    kind: ArtifactKind,
    producer: Option<&InvocationId>,
    created_ms: u64,
    content_hash: &str,
) -> ArtifactId {
    let envelope = json!({
        "kind": kind.as_str(),
        "producer": producer.map(|p| p.as_str()),
        "created_ms": created_ms,
        "content_hash": content_hash,
    });
    ArtifactId::from(sha256_hex(envelope.to_string().as_bytes()))
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ArtifactId) -> PathBuf {
        let s = id.as_str();
        self.root.join("objects").join(&s[..2]).join(format!("{s}.json"))
    }

    /// Validate and persist a payload, returning its id.
    pub fn put(&self, payload: ArtifactPayload, producer: Option<&InvocationId>) -> Result<ArtifactId> {
        payload.validate()?;
        let kind = payload.kind();
        let created_ms = now_ms();
        let hash = content_hash(&payload)?;
        let id = envelope_id(kind, producer, created_ms, &hash);

        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        let artifact = Artifact {
            id: id.clone(),
            kind,
            producer: producer.cloned(),
            created_ms,
            content_hash: hash,
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&artifact)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self
            .root
            .join("tmp")
            .join(format!("{}.{:016x}.tmp", id.as_str(), rand::random::<u64>()));
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        if path.exists() {
            let _ = fs::remove_file(&tmp);
        } else {
            fs::rename(&tmp, &path)?;
        }

        log(
            Level::Debug,
            Domain::Artifact,
            "artifact_put",
            obj(&[
                ("artifact_id", v_str(id.as_str())),
                ("kind", v_str(kind.as_str())),
                ("producer", producer.map(|p| v_str(p.as_str())).unwrap_or_default()),
            ]),
        );
        Ok(id)
    }

    pub fn exists(&self, id: &ArtifactId) -> bool {
        id.is_well_formed() && self.object_path(id).exists()
    }

    /// Load an artifact and check it against its id.
    pub fn get(&self, id: &ArtifactId) -> Result<Artifact> {
        if !self.exists(id) {
            return Err(PipelineError::ArtifactNotFound(id.clone()));
        }
        let bytes = fs::read(self.object_path(id))?;
        let artifact: Artifact = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::InvalidArtifact(format!("{id}: {e}")))?;

        let hash = content_hash(&artifact.payload)?;
        if hash != artifact.content_hash || artifact.kind != artifact.payload.kind() {
            return Err(PipelineError::InvalidArtifact(format!("{id}: content does not match envelope")));
        }
        let expected = envelope_id(artifact.kind, artifact.producer.as_ref(), artifact.created_ms, &hash);
        if &expected != id || artifact.id != *id {
            return Err(PipelineError::InvalidArtifact(format!("{id}: envelope hash mismatch")));
        }
        Ok(artifact)
    }

    /// Load an artifact that must be of `kind`.
    pub fn get_as(&self, id: &ArtifactId, kind: ArtifactKind) -> Result<Artifact> {
        let artifact = self.get(id)?;
        if artifact.kind != kind {
            return Err(PipelineError::InvalidArtifact(format!(
                "{id}: expected {kind}, found {}",
                artifact.kind
            )));
        }
        Ok(artifact)
    }
}
