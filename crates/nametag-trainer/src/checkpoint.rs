//! Checkpoint store.
//!
//! A checkpoint is one safetensors file. Model parameters are stored as
//! `model.<name>`, Adam moments as `optimizer.m.<name>` and
//! `optimizer.v.<name>`, and everything else (hyperparameters, vocabularies,
//! counters, scores, training state, scalar optimizer state) is JSON under the
//! `nametag.checkpoint` metadata key.
//!
//! Files are never written in place. [`Staging`] writes each file as a
//! `<name>.tmp` sibling and renames them all on [`Staging::commit`], rolling
//! back from `<name>.bak` copies if any rename fails. Dropping an uncommitted
//! stage removes the temporaries.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Hyperparameters;
use crate::data::{Counters, Vocabularies};
use crate::model::named_vars;
use crate::optimizer::{Adam, AdamState};
use crate::trainer::{BestScores, TrainingState};

pub const METADATA_KEY: &str = "nametag.checkpoint";

const MODEL_PREFIX: &str = "model.";
const FIRST_MOMENT_PREFIX: &str = "optimizer.m.";
const SECOND_MOMENT_PREFIX: &str = "optimizer.v.";

/// Adam state: scalars plus per-parameter moments.
#[derive(Debug, Clone)]
pub struct OptimizerSnapshot {
    pub state: AdamState,
    pub first_moments: BTreeMap<String, Tensor>,
    pub second_moments: BTreeMap<String, Tensor>,
}

/// Everything needed to rebuild a trained model and resume its optimizer.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model_params: BTreeMap<String, Tensor>,
    pub optimizer: OptimizerSnapshot,
    pub hyperparameters: Hyperparameters,
    pub vocabularies: Vocabularies,
    pub counters: Counters,
    pub scores: BestScores,
    pub state: TrainingState,
}

#[derive(Serialize, Deserialize)]
struct Header {
    hyperparameters: Hyperparameters,
    vocabularies: Vocabularies,
    #[serde(rename = "frequency_counters")]
    counters: Counters,
    scores: BestScores,
    state: TrainingState,
    optimizer: AdamState,
}

impl Checkpoint {
    /// Snapshot the current parameters and optimizer.
    pub fn capture(
        varmap: &VarMap,
        adam: &Adam,
        hyperparameters: &Hyperparameters,
        vocabularies: &Vocabularies,
        counters: &Counters,
        state: &TrainingState,
    ) -> Result<Self> {
        let mut model_params = BTreeMap::new();
        for (name, var) in named_vars(varmap)? {
            // Copy so later optimizer steps don't show through
            model_params.insert(name, var.as_tensor().copy()?);
        }
        let (first_moments, second_moments) = adam.moments();
        Ok(Self {
            model_params,
            optimizer: OptimizerSnapshot {
                state: adam.state(),
                first_moments,
                second_moments,
            },
            hyperparameters: hyperparameters.clone(),
            vocabularies: vocabularies.clone(),
            counters: counters.clone(),
            scores: state.best,
            state: state.clone(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = Header {
            hyperparameters: self.hyperparameters.clone(),
            vocabularies: self.vocabularies.clone(),
            counters: self.counters.clone(),
            scores: self.scores,
            state: self.state.clone(),
            optimizer: self.optimizer.state,
        };
        let metadata = HashMap::from([(
            METADATA_KEY.to_string(),
            serde_json::to_string(&header).context("failed to encode checkpoint metadata")?,
        )]);

        let mut tensors: Vec<(String, &Tensor)> = Vec::new();
        for (name, tensor) in &self.model_params {
            tensors.push((format!("{MODEL_PREFIX}{name}"), tensor));
        }
        for (name, tensor) in &self.optimizer.first_moments {
            tensors.push((format!("{FIRST_MOMENT_PREFIX}{name}"), tensor));
        }
        for (name, tensor) in &self.optimizer.second_moments {
            tensors.push((format!("{SECOND_MOMENT_PREFIX}{name}"), tensor));
        }

        safetensors::serialize(tensors, &Some(metadata))
            .map_err(|e| anyhow!("failed to serialize checkpoint: {e}"))
    }

    pub fn from_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let (_, metadata) = SafeTensors::read_metadata(bytes)
            .map_err(|e| anyhow!("not a safetensors checkpoint: {e}"))?;
        let json = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
            .ok_or_else(|| anyhow!("checkpoint has no {METADATA_KEY} metadata"))?;
        let header: Header =
            serde_json::from_str(json).context("invalid checkpoint metadata")?;

        let mut model_params = BTreeMap::new();
        let mut first_moments = BTreeMap::new();
        let mut second_moments = BTreeMap::new();
        for (name, tensor) in candle_core::safetensors::load_buffer(bytes, device)? {
            if let Some(rest) = name.strip_prefix(FIRST_MOMENT_PREFIX) {
                first_moments.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(SECOND_MOMENT_PREFIX) {
                second_moments.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
                model_params.insert(rest.to_string(), tensor);
            } else {
                warn!(tensor = %name, "ignoring unknown checkpoint tensor");
            }
        }

        let mut state = header.state;
        state.best = header.scores;
        Ok(Self {
            model_params,
            optimizer: OptimizerSnapshot {
                state: header.optimizer,
                first_moments,
                second_moments,
            },
            hyperparameters: header.hyperparameters,
            vocabularies: header.vocabularies,
            counters: header.counters,
            scores: header.scores,
            state,
        })
    }

    /// Atomically write the checkpoint to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut staging = Staging::new();
        staging.stage(path.as_ref(), &self.to_bytes()?)?;
        staging.commit()
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let checkpoint = Self::from_bytes(&bytes, device)
            .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
        info!(
            path = %path.display(),
            params = checkpoint.model_params.len(),
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }

    /// Copy stored parameters into `varmap` and moments into `adam`.
    pub fn restore(&self, varmap: &VarMap, adam: &mut Adam) -> Result<()> {
        for (name, var) in named_vars(varmap)? {
            let Some(tensor) = self.model_params.get(&name) else {
                bail!("checkpoint has no parameter {name}");
            };
            if tensor.shape() != var.shape() {
                bail!(
                    "parameter {name} has shape {:?} in checkpoint, {:?} in model",
                    tensor.dims(),
                    var.dims()
                );
            }
            var.set(tensor)?;
        }
        adam.restore(
            &self.optimizer.state,
            &self.optimizer.first_moments,
            &self.optimizer.second_moments,
        )
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// A set of files written together or not at all.
#[derive(Default)]
pub struct Staging {
    staged: Vec<(PathBuf, PathBuf)>,
}

impl Staging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `bytes` next to `dest` without touching `dest` itself.
    pub fn stage(&mut self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = tmp_path(dest);
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("failed to write {}", tmp.display()));
        }
        debug!(path = %tmp.display(), bytes = bytes.len(), "staged");
        self.staged.push((tmp, dest.to_path_buf()));
        Ok(())
    }

    /// Move every staged file into place.
    ///
    /// Existing destinations are moved to `<name>.bak` first. If any
    /// replacement fails, the ones already made are undone from their
    /// backups, so either every destination holds its new content or every
    /// destination is as it was.
    pub fn commit(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut replaced: Vec<(&Path, Option<PathBuf>)> = Vec::with_capacity(staged.len());
        for (i, (tmp, dest)) in staged.iter().enumerate() {
            match replace(tmp, dest) {
                Ok(backup) => replaced.push((dest.as_path(), backup)),
                Err(e) => {
                    roll_back(&replaced);
                    // Drop cleans up whatever was not renamed
                    self.staged = staged[i..].to_vec();
                    return Err(e);
                }
            }
        }
        for (_, backup) in replaced {
            if let Some(backup) = backup {
                if let Err(e) = fs::remove_file(&backup) {
                    warn!(path = %backup.display(), error = %e, "failed to remove backup");
                }
            }
        }
        Ok(())
    }
}

fn backup_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    dest.with_file_name(name)
}

/// Rename `tmp` over `dest`, keeping the previous `dest` as a backup.
fn replace(tmp: &Path, dest: &Path) -> Result<Option<PathBuf>> {
    let backup = match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => bail!("failed to replace {}: is a directory", dest.display()),
        Ok(_) => {
            let backup = backup_path(dest);
            fs::rename(dest, &backup)
                .with_context(|| format!("failed to back up {}", dest.display()))?;
            Some(backup)
        }
        Err(_) => None,
    };
    if let Err(e) = fs::rename(tmp, dest) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, dest);
        }
        return Err(e).with_context(|| format!("failed to replace {}", dest.display()));
    }
    Ok(backup)
}

fn roll_back(replaced: &[(&Path, Option<PathBuf>)]) {
    for (dest, backup) in replaced.iter().rev() {
        let restored = match backup {
            Some(backup) => fs::rename(backup, dest),
            None => fs::remove_file(dest),
        };
        match restored {
            Ok(()) => debug!(path = %dest.display(), "rolled back"),
            Err(e) => warn!(path = %dest.display(), error = %e, "failed to roll back"),
        }
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        for (tmp, _) in &self.staged {
            if fs::remove_file(tmp).is_ok() {
                debug!(path = %tmp.display(), "discarded staged file");
            }
        }
    }
}
