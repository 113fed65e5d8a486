//! Best-model selection and checkpoint persistence.

use crate::error::FitError;
use crate::persistence;
use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Version written into every checkpoint record.
pub const FORMAT_VERSION: u32 = 1;

/// Owned copy of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    #[serde(with = "f32_base64")]
    pub values: Vec<f32>,
}

impl TensorRecord {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, FitError> {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            values,
        })
    }

    pub fn to_tensor(&self, device: &candle_core::Device) -> Result<Tensor, FitError> {
        Ok(Tensor::from_vec(
            self.values.clone(),
            self.shape.clone(),
            device,
        )?)
    }
}

/// Snapshot of every model parameter, keyed by parameter name.
///
/// Holds its own copy of the values; training after a capture never changes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelState(BTreeMap<String, TensorRecord>);

impl ModelState {
    /// Deep-copy all variables of `varmap`.
    pub fn capture(varmap: &VarMap) -> Result<Self, FitError> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| FitError::model("parameter map lock poisoned"))?;
        let mut tensors = BTreeMap::new();
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), TensorRecord::from_tensor(var.as_tensor())?);
        }
        Ok(Self(tensors))
    }

    /// Overwrite the variables of `varmap` with this snapshot.
    ///
    /// Every variable must have a record of the same shape.
    pub fn apply_to(&self, varmap: &VarMap) -> Result<(), FitError> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| FitError::model("parameter map lock poisoned"))?;
        for (name, var) in data.iter() {
            let record = self
                .0
                .get(name)
                .ok_or_else(|| FitError::model(format!("snapshot has no parameter {name}")))?;
            if record.shape.as_slice() != var.dims() {
                return Err(FitError::model(format!(
                    "shape mismatch for {name}: snapshot {:?}, model {:?}",
                    record.shape,
                    var.dims()
                )));
            }
            let value = record.to_tensor(var.device())?.to_dtype(var.dtype())?;
            var.set(&value)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: TensorRecord) {
        self.0.insert(name.into(), record);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn num_values(&self) -> usize {
        self.0.values().map(|r| r.values.len()).sum()
    }

    /// SHA-256 over names, shapes and raw value bits.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, record) in &self.0 {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((record.shape.len() as u64).to_le_bytes());
            for dim in &record.shape {
                hasher.update((*dim as u64).to_le_bytes());
            }
            for v in &record.values {
                hasher.update(v.to_le_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Which snapshot wins when a validation loss equals the best so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// `loss <= best`: the most recent of equal losses is kept.
    #[default]
    KeepLatest,
    /// `loss < best`: the first epoch reaching the minimum is kept.
    KeepEarliest,
}

/// Tracks the best validation loss of a run and the matching parameter snapshot.
#[derive(Debug, Clone)]
pub struct CheckpointSelector {
    tie_policy: TiePolicy,
    best_loss: f64,
    best_state: Option<ModelState>,
    best_epoch: Option<usize>,
    observed: usize,
}

impl Default for CheckpointSelector {
    fn default() -> Self {
        Self::new(TiePolicy::default())
    }
}

impl CheckpointSelector {
    pub fn new(tie_policy: TiePolicy) -> Self {
        Self {
            tie_policy,
            best_loss: f64::INFINITY,
            best_state: None,
            best_epoch: None,
            observed: 0,
        }
    }

    fn improves(&self, loss: f64) -> bool {
        match self.tie_policy {
            TiePolicy::KeepLatest => loss <= self.best_loss,
            TiePolicy::KeepEarliest => loss < self.best_loss,
        }
    }

    /// Record the loss of a completed validation epoch.
    ///
    /// On improvement the current state is copied and `true` is returned. A NaN
    /// loss never improves.
    pub fn observe(&mut self, validation_loss: f64, current: &ModelState) -> bool {
        self.observed += 1;
        if !self.improves(validation_loss) {
            return false;
        }
        self.best_loss = validation_loss;
        self.best_state = Some(current.clone());
        self.best_epoch = Some(self.observed);
        true
    }

    /// Like [`observe`](Self::observe), but only captures the state when it is needed.
    pub fn observe_with<F>(&mut self, validation_loss: f64, capture: F) -> Result<bool, FitError>
    where
        F: FnOnce() -> Result<ModelState, FitError>,
    {
        if !self.improves(validation_loss) {
            self.observed += 1;
            return Ok(false);
        }
        let state = capture()?;
        self.observed += 1;
        self.best_loss = validation_loss;
        self.best_state = Some(state);
        self.best_epoch = Some(self.observed);
        Ok(true)
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_state(&self) -> Option<&ModelState> {
        self.best_state.as_ref()
    }

    /// 1-based index of the observation that produced the snapshot.
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Write the best snapshot and `metadata` to `destination` as one JSON record.
    pub fn save<M: Serialize>(&self, destination: &Path, metadata: &M) -> Result<(), FitError> {
        let model = self.best_state.as_ref().ok_or(FitError::NoSnapshot)?;
        let record = CheckpointView {
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            best_loss: Some(self.best_loss).filter(|l| l.is_finite()),
            best_epoch: self.best_epoch,
            digest: model.digest(),
            model,
            metadata,
        };
        persistence::atomic_write_json(destination, &record)?;
        tracing::info!(
            path = %destination.display(),
            best_loss = self.best_loss,
            best_epoch = ?self.best_epoch,
            "Checkpoint saved"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct CheckpointView<'a, M> {
    format_version: u32,
    saved_at: DateTime<Utc>,
    best_loss: Option<f64>,
    best_epoch: Option<usize>,
    digest: String,
    model: &'a ModelState,
    metadata: &'a M,
}

/// A checkpoint read back from disk.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointRecord<M> {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub digest: String,
    pub model: ModelState,
    pub metadata: M,
}

/// Load a checkpoint written by [`CheckpointSelector::save`], verifying its digest.
pub fn load_checkpoint<M: DeserializeOwned>(path: &Path) -> Result<CheckpointRecord<M>, FitError> {
    let record: CheckpointRecord<M> = persistence::load_json(path)?.ok_or_else(|| {
        FitError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("checkpoint not found: {}", path.display()),
        ))
    })?;
    if record.format_version != FORMAT_VERSION {
        return Err(FitError::FormatVersion(record.format_version));
    }
    let found = record.model.digest();
    if found != record.digest {
        return Err(FitError::Integrity {
            expected: record.digest,
            found,
        });
    }
    Ok(record)
}

mod f32_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(de::Error::custom(format!(
                "tensor payload of {} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn state(tag: f32) -> ModelState {
        let mut s = ModelState::default();
        s.insert(
            "fc0.weight",
            TensorRecord {
                shape: vec![2, 2],
                values: vec![tag, tag + 1.0, tag + 2.0, tag + 3.0],
            },
        );
        s
    }

    #[test]
    fn test_initial_state() {
        let selector = CheckpointSelector::default();
        assert_eq!(selector.best_loss(), f64::INFINITY);
        assert!(selector.best_state().is_none());
        assert_eq!(selector.best_epoch(), None);
    }

    #[test]
    fn test_ties_keep_latest_by_default() {
        let mut selector = CheckpointSelector::default();
        let losses = [0.9, 0.4, 0.5, 0.4];
        let updates: Vec<bool> = losses
            .iter()
            .enumerate()
            .map(|(i, l)| selector.observe(*l, &state(i as f32)))
            .collect();
        assert_eq!(updates, vec![true, true, false, true]);
        assert_eq!(selector.best_loss(), 0.4);
        assert_eq!(selector.best_epoch(), Some(4));
        assert_eq!(selector.best_state(), Some(&state(3.0)));
    }

    #[test]
    fn test_ties_keep_earliest() {
        let mut selector = CheckpointSelector::new(TiePolicy::KeepEarliest);
        for (i, l) in [0.9, 0.4, 0.5, 0.4].iter().enumerate() {
            selector.observe(*l, &state(i as f32));
        }
        assert_eq!(selector.best_loss(), 0.4);
        assert_eq!(selector.best_epoch(), Some(2));
        assert_eq!(selector.best_state(), Some(&state(1.0)));
    }

    #[test]
    fn test_nan_never_improves() {
        let mut selector = CheckpointSelector::default();
        assert!(!selector.observe(f64::NAN, &state(0.0)));
        assert!(selector.best_state().is_none());
        assert_eq!(selector.observed(), 1);
    }

    #[test]
    fn test_observe_with_skips_capture_without_improvement() {
        let mut selector = CheckpointSelector::default();
        assert!(selector.observe_with(0.3, || Ok(state(0.0))).unwrap());
        let improved = selector
            .observe_with(0.5, || panic!("capture must not run"))
            .unwrap();
        assert!(!improved);
        assert_eq!(selector.best_epoch(), Some(1));
        assert_eq!(selector.observed(), 2);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let mut selector = CheckpointSelector::default();
        let mut current = state(1.0);
        selector.observe(0.2, &current);
        current.insert(
            "fc0.weight",
            TensorRecord {
                shape: vec![2, 2],
                values: vec![9.0; 4],
            },
        );
        assert_eq!(selector.best_state(), Some(&state(1.0)));
    }

    #[test]
    fn test_save_without_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let selector = CheckpointSelector::default();
        let err = selector
            .save(&dir.path().join("model.json"), &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, FitError::NoSnapshot));
        assert!(!dir.path().join("model.json").exists());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        let mut selector = CheckpointSelector::default();
        let snapshot = state(-0.123_456_7);
        selector.observe(0.25, &snapshot);

        let metadata = serde_json::json!({"n_layers": 5, "model_fn": "model.json"});
        selector.save(&path, &metadata).unwrap();

        let record: CheckpointRecord<serde_json::Value> = load_checkpoint(&path).unwrap();
        assert_eq!(record.model, snapshot);
        assert_eq!(record.metadata, metadata);
        assert_eq!(record.best_loss, Some(0.25));
        assert_eq!(record.best_epoch, Some(1));
    }

    #[test]
    fn test_save_to_unwritable_destination_keeps_state() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let mut selector = CheckpointSelector::default();
        selector.observe(0.1, &state(2.0));
        let err = selector
            .save(&blocker.join("model.json"), &serde_json::json!(null))
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(selector.best_loss(), 0.1);
        assert_eq!(selector.best_state(), Some(&state(2.0)));
    }

    #[test]
    fn test_load_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        let mut selector = CheckpointSelector::default();
        selector.observe(0.1, &state(2.0));
        selector.save(&path, &serde_json::json!({})).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["digest"] = serde_json::json!("0000");
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let err = load_checkpoint::<serde_json::Value>(&path).unwrap_err();
        assert!(matches!(err, FitError::Integrity { .. }));
    }

    #[test]
    fn test_capture_and_apply_varmap() {
        use candle_core::Device;
        use candle_nn::{Init, VarMap};

        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let w = varmap
            .get((2, 3), "w", Init::Const(1.5), DType::F32, &dev)
            .unwrap();
        let saved = ModelState::capture(&varmap).unwrap();
        assert_eq!(saved.get("w").unwrap().values, vec![1.5; 6]);

        let data = varmap.data().lock().unwrap();
        data.get("w")
            .unwrap()
            .set(&Tensor::zeros((2, 3), DType::F32, &dev).unwrap())
            .unwrap();
        drop(data);
        assert_eq!(ModelState::capture(&varmap).unwrap().get("w").unwrap().values, vec![0.0; 6]);

        saved.apply_to(&varmap).unwrap();
        let restored = w.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(restored, vec![1.5; 6]);
    }
}
