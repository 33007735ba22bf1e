//! The loaded Whisper model and the process-wide model registry.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use candle::{DType, Device};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::vocabulary::{Vocabulary, WhisperVocabulary};
use crate::{SPEC_NAME, SPEC_REVISION};

/// A loaded model created through the registry.
pub trait Model: Send + Sync {
    fn spec_name(&self) -> &'static str;
    fn spec_revision(&self) -> u32;
    fn as_any(&self) -> &dyn Any;
}

/// Immutable per-model data shared read-only across replicas.
#[derive(Debug, Clone)]
pub struct WhisperModel {
    vocabulary: WhisperVocabulary,
    config: ModelConfig,
    device: Device,
    dtype: DType,
    preferred_size_multiple: usize,
}

impl WhisperModel {
    pub fn new(vocabulary: Vocabulary, config: ModelConfig, device: Device, dtype: DType) -> Self {
        Self {
            vocabulary: WhisperVocabulary::new(Arc::new(vocabulary)),
            config,
            device,
            dtype,
            preferred_size_multiple: 1,
        }
    }

    /// Loads a converted model directory: `vocabulary.txt` is required,
    /// `config.json` optional.
    pub fn from_dir(dir: impl AsRef<Path>, device: Device, dtype: DType) -> Result<Self> {
        let dir = dir.as_ref();
        let vocabulary = Vocabulary::from_file(dir.join("vocabulary.txt"))?;
        let config_path = dir.join("config.json");
        let config = if config_path.exists() {
            ModelConfig::from_file(config_path)?
        } else {
            ModelConfig::default()
        };
        Ok(Self::new(vocabulary, config, device, dtype))
    }

    pub fn with_preferred_size_multiple(mut self, multiple: usize) -> Self {
        self.preferred_size_multiple = multiple.max(1);
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        self.vocabulary.vocabulary()
    }

    pub fn whisper_vocabulary(&self) -> &WhisperVocabulary {
        &self.vocabulary
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_multilingual(&self) -> bool {
        self.vocabulary.is_multilingual()
    }

    pub fn preferred_size_multiple(&self) -> usize {
        self.preferred_size_multiple
    }
}

impl Model for WhisperModel {
    fn spec_name(&self) -> &'static str {
        SPEC_NAME
    }

    fn spec_revision(&self) -> u32 {
        SPEC_REVISION
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type ModelFactory = fn(&Path, &Device, DType) -> Result<Arc<dyn Model>>;

fn load_whisper(dir: &Path, device: &Device, dtype: DType) -> Result<Arc<dyn Model>> {
    Ok(Arc::new(WhisperModel::from_dir(dir, device.clone(), dtype)?))
}

fn registry() -> &'static RwLock<HashMap<String, ModelFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ModelFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut factories: HashMap<String, ModelFactory> = HashMap::new();
        factories.insert(SPEC_NAME.to_string(), load_whisper);
        RwLock::new(factories)
    })
}

/// Registers a model factory under a spec name. Registration happens once
/// at startup; re-registering a name fails.
pub fn register_model(name: &str, factory: ModelFactory) -> Result<()> {
    let mut factories = registry().write().unwrap();
    if factories.contains_key(name) {
        return Err(Error::runtime(format!(
            "a model is already registered under the name {name}"
        )));
    }
    factories.insert(name.to_string(), factory);
    Ok(())
}

/// Creates a model from a converted directory through the registered
/// factory for the given spec name.
pub fn create_model(
    name: &str,
    dir: impl AsRef<Path>,
    device: &Device,
    dtype: DType,
) -> Result<Arc<dyn Model>> {
    let factory = {
        let factories = registry().read().unwrap();
        factories.get(name).copied().ok_or_else(|| {
            Error::runtime(format!("no model is registered under the name {name}"))
        })?
    };
    factory(dir.as_ref(), device, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EOT_TOKEN, NO_TIMESTAMPS_TOKEN, SOT_TOKEN};

    fn write_model_dir(dir: &Path, with_config: bool) -> Result<()> {
        let mut tokens = vec![
            "a".to_string(),
            EOT_TOKEN.to_string(),
            SOT_TOKEN.to_string(),
            "<|en|>".to_string(),
            "<|nospeech|>".to_string(),
            NO_TIMESTAMPS_TOKEN.to_string(),
        ];
        tokens.push("<|0.00|>".to_string());
        std::fs::write(dir.join("vocabulary.txt"), tokens.join("\n"))?;
        if with_config {
            std::fs::write(
                dir.join("config.json"),
                r#"{"suppress_ids": [0], "lang_ids": [3]}"#,
            )?;
        }
        Ok(())
    }

    #[test]
    fn registry_creates_whisper_models() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_model_dir(dir.path(), true)?;
        let model = create_model(SPEC_NAME, dir.path(), &Device::Cpu, DType::F32)?;
        assert_eq!(model.spec_name(), SPEC_NAME);
        assert_eq!(model.spec_revision(), 3);
        let whisper = model.as_any().downcast_ref::<WhisperModel>().unwrap();
        assert_eq!(whisper.config().suppress_ids, [0]);
        assert_eq!(whisper.whisper_vocabulary().sot_id(), 2);
        Ok(())
    }

    #[test]
    fn missing_config_defaults_to_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_model_dir(dir.path(), false)?;
        let model = WhisperModel::from_dir(dir.path(), Device::Cpu, DType::F32)?;
        assert_eq!(model.config(), &ModelConfig::default());
        Ok(())
    }

    #[test]
    fn unknown_spec_name_is_rejected() {
        let err = create_model("NotASpec", "/nowhere", &Device::Cpu, DType::F32);
        assert!(matches!(err, Err(Error::Runtime(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        assert!(matches!(
            register_model(SPEC_NAME, load_whisper),
            Err(Error::Runtime(_))
        ));
    }
}
