//! Model capability and artifact loading
//!
//! The engine treats text generation as an opaque capability exposed by a
//! loaded model: [`GenerativeModel::generate`] takes a batch and returns one
//! output per input, in order. [`ModelLoader`] materializes a model and its
//! tokenizer from a registered artifact.
//!
//! [`ArtifactLoader`] is the built-in backend. It memory-maps the weights
//! file, reads the tokenizer vocabulary, and produces a deterministic
//! continuation of each prompt. Numeric backends plug in through the traits.

use crate::artifact::{CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};
use crate::registry::ModelDescriptor;
use crate::request::SamplingParams;
use memmap2::Mmap;
use modelserve_common::{Result, ServeError};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Device a model is materialized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = ServeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| ServeError::config(format!("Unknown device: {}", other))),
        }
    }
}

/// One request's share of a batch
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub prompts: Vec<String>,
    pub params: SamplingParams,
}

/// Generated texts for one request, `num_sequences` per prompt in prompt order
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub texts: Vec<String>,
}

/// Opaque text-generation capability of a loaded model
pub trait GenerativeModel: Send + Sync {
    /// Generate outputs for a batch, one per input and in input order
    fn generate(&self, batch: &[GenerationInput]) -> Result<Vec<GenerationOutput>>;

    /// One-time preparation for inference
    fn optimize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Resident bytes held by the model
    fn memory_bytes(&self) -> u64;

    /// Scratch bytes the model expects to allocate for a batch
    fn workspace_bytes(&self, _batch: &[GenerationInput]) -> u64 {
        0
    }
}

/// Tokenizer paired with a model
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Number of tokens in `text`
    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Freshly materialized model and tokenizer
pub struct LoadedModel {
    pub model: Box<dyn GenerativeModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

/// Materializes registered artifacts
pub trait ModelLoader: Send + Sync {
    fn load(&self, descriptor: &ModelDescriptor, device: Device) -> Result<LoadedModel>;
}

/// Subset of `config.json` the built-in backend reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default)]
    pub model_type: Option<String>,

    #[serde(default)]
    pub vocab_size: Option<usize>,

    /// Upper bound on generated tokens per sequence
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
}

fn default_max_new_tokens() -> usize {
    32
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerFile {
    #[serde(default)]
    vocab: HashMap<String, u32>,
}

/// Whitespace tokenizer over a fixed vocabulary
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    vocab: HashMap<String, u32>,
    /// Tokens ordered by id
    ordered: Vec<String>,
    unknown_id: u32,
}

impl VocabTokenizer {
    /// Build from a token -> id map
    pub fn new(vocab: HashMap<String, u32>) -> Self {
        let mut ordered: Vec<(String, u32)> =
            vocab.iter().map(|(token, &id)| (token.clone(), id)).collect();
        ordered.sort_by_key(|(_, id)| *id);
        let unknown_id = ordered.last().map(|(_, id)| id + 1).unwrap_or(0);

        Self {
            vocab,
            ordered: ordered.into_iter().map(|(token, _)| token).collect(),
            unknown_id,
        }
    }

    /// Read the `vocab` table from a tokenizer file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: TokenizerFile = serde_json::from_str(&content)?;
        Ok(Self::new(file.vocab))
    }

    /// Token at position `index` of the id-ordered vocabulary
    pub fn token_at(&self, index: usize) -> Option<&str> {
        self.ordered.get(index).map(String::as_str)
    }

    pub fn vocab_len(&self) -> usize {
        self.ordered.len()
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| self.vocab.get(word).copied().unwrap_or(self.unknown_id))
            .collect()
    }
}

/// Loader for artifact directories holding config, weights and tokenizer
#[derive(Debug, Default, Clone)]
pub struct ArtifactLoader;

impl ArtifactLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for ArtifactLoader {
    fn load(&self, descriptor: &ModelDescriptor, device: Device) -> Result<LoadedModel> {
        let root = descriptor.artifact_path.as_path();
        info!(
            "Loading {}:{} from {} onto {}",
            descriptor.name,
            descriptor.version,
            root.display(),
            device
        );

        let config_text = std::fs::read_to_string(root.join(CONFIG_FILE))
            .map_err(|e| ServeError::load_failed(format!("Failed to read config: {}", e)))?;
        let config: ArtifactConfig = serde_json::from_str(&config_text)
            .map_err(|e| ServeError::load_failed(format!("Invalid config: {}", e)))?;

        let weights_file = File::open(root.join(WEIGHTS_FILE))
            .map_err(|e| ServeError::load_failed(format!("Failed to open weights: {}", e)))?;
        // SAFETY: the mapping is read-only and the artifact is not modified while registered.
        let weights = unsafe { Mmap::map(&weights_file) }
            .map_err(|e| ServeError::load_failed(format!("Failed to map weights: {}", e)))?;

        let tokenizer = Arc::new(
            VocabTokenizer::from_file(&root.join(TOKENIZER_FILE))
                .map_err(|e| ServeError::load_failed(format!("Invalid tokenizer: {}", e)))?,
        );

        debug!(
            "Model type {:?}, {} weight bytes, {} vocab entries",
            config.model_type,
            weights.len(),
            tokenizer.vocab_len()
        );

        Ok(LoadedModel {
            model: Box::new(ReferenceModel {
                config,
                weights,
                tokenizer: tokenizer.clone(),
                eval_mode: false,
            }),
            tokenizer,
        })
    }
}

/// Deterministic continuation model backed by mapped weights
pub struct ReferenceModel {
    config: ArtifactConfig,
    weights: Mmap,
    tokenizer: Arc<VocabTokenizer>,
    eval_mode: bool,
}

impl ReferenceModel {
    fn continue_prompt(&self, prompt: &str, params: &SamplingParams, sequence: u32) -> String {
        let prompt_tokens = self.tokenizer.encode(prompt);
        let budget = (params.max_length as usize)
            .saturating_sub(prompt_tokens.len())
            .min(self.config.max_new_tokens);

        let vocab_len = self
            .config
            .vocab_size
            .unwrap_or(usize::MAX)
            .min(self.tokenizer.vocab_len());
        if budget == 0 || vocab_len == 0 {
            return prompt.to_string();
        }

        // top_k narrows the candidate range; temperature zero is fully greedy
        let candidates = match params.top_k {
            0 => vocab_len,
            k => vocab_len.min(k as usize),
        };
        let spread = if params.temperature == 0.0 { 1 } else { candidates };

        let mut state = prompt_tokens
            .iter()
            .fold(0xcbf2_9ce4_8422_2325u64 ^ u64::from(sequence), |acc, &id| {
                mix(acc, u64::from(id))
            });
        let mut text = prompt.to_string();

        for position in 0..budget {
            let weight = if self.weights.is_empty() {
                0
            } else {
                self.weights[(state as usize) % self.weights.len()]
            };
            state = mix(state, u64::from(weight) ^ position as u64);
            let index = (state % spread as u64) as usize;
            if let Some(token) = self.tokenizer.token_at(index) {
                text.push(' ');
                text.push_str(token);
            }
        }

        text
    }
}

fn mix(state: u64, value: u64) -> u64 {
    (state ^ value).wrapping_mul(0x0100_0000_01b3).rotate_left(17)
}

impl GenerativeModel for ReferenceModel {
    fn generate(&self, batch: &[GenerationInput]) -> Result<Vec<GenerationOutput>> {
        if !self.eval_mode {
            debug!("Generating with an unoptimized model");
        }

        Ok(batch
            .iter()
            .map(|input| GenerationOutput {
                texts: input
                    .prompts
                    .iter()
                    .flat_map(|prompt| {
                        (0..input.params.num_sequences)
                            .map(move |sequence| self.continue_prompt(prompt, &input.params, sequence))
                    })
                    .collect(),
            })
            .collect())
    }

    fn optimize(&mut self) -> Result<()> {
        #[cfg(unix)]
        self.weights
            .advise(memmap2::Advice::WillNeed)
            .map_err(|e| ServeError::load_failed(format!("madvise failed: {}", e)))?;
        self.eval_mode = true;
        Ok(())
    }

    fn memory_bytes(&self) -> u64 {
        self.weights.len() as u64
    }

    fn workspace_bytes(&self, batch: &[GenerationInput]) -> u64 {
        // One f32 activation row per token position
        let hidden = self.config.vocab_size.unwrap_or(1024) as u64;
        batch
            .iter()
            .map(|input| {
                u64::from(input.params.max_length)
                    .saturating_mul(input.prompts.len() as u64)
                    .saturating_mul(u64::from(input.params.num_sequences))
                    .saturating_mul(hidden)
                    .saturating_mul(4)
            })
            .fold(0u64, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelDescriptor, ModelStatus};
    use crate::test_support::write_artifact;

    fn descriptor(path: &Path) -> ModelDescriptor {
        ModelDescriptor {
            name: "demo".to_string(),
            version: "1.0".to_string(),
            artifact_path: path.to_path_buf(),
            content_hash: String::new(),
            registered_at: chrono::Utc::now(),
            metadata: Default::default(),
            status: ModelStatus::Registered,
        }
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!(Device::Cuda(3).to_string(), "cuda:3");
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn test_vocab_tokenizer() {
        let tokenizer = VocabTokenizer::new(
            [("hello".to_string(), 0), ("world".to_string(), 1)]
                .into_iter()
                .collect(),
        );
        assert_eq!(tokenizer.encode("hello world"), vec![0, 1]);
        assert_eq!(tokenizer.encode("hello there"), vec![0, 2]);
        assert_eq!(tokenizer.count_tokens("a b c"), 3);
        assert_eq!(tokenizer.token_at(1), Some("world"));
    }

    #[test]
    fn test_artifact_loader_generates_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path());

        let mut loaded = ArtifactLoader::new().load(&descriptor(dir.path()), Device::Cpu).unwrap();
        loaded.model.optimize().unwrap();
        assert!(loaded.model.memory_bytes() > 0);

        let input = GenerationInput {
            prompts: vec!["hello".to_string(), "world".to_string()],
            params: SamplingParams {
                max_length: 8,
                num_sequences: 2,
                ..SamplingParams::default()
            },
        };

        let first = loaded.model.generate(std::slice::from_ref(&input)).unwrap();
        let second = loaded.model.generate(&[input]).unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].texts.len(), 4);
        assert!(first[0].texts[0].starts_with("hello"));
        assert!(first[0].texts[2].starts_with("world"));
        assert!(loaded.tokenizer.count_tokens(&first[0].texts[0]) <= 8);
    }

    #[test]
    fn test_workspace_estimate_saturates() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path());
        let loaded = ArtifactLoader::new().load(&descriptor(dir.path()), Device::Cpu).unwrap();

        let small = GenerationInput {
            prompts: vec!["hello".to_string()],
            params: SamplingParams {
                max_length: 2,
                num_sequences: 1,
                ..SamplingParams::default()
            },
        };
        // vocab_size 8, four bytes per entry
        assert_eq!(loaded.model.workspace_bytes(&[small]), 2 * 8 * 4);

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"model_type": "gpt2", "vocab_size": 1000000000}"#,
        )
        .unwrap();
        let wide = ArtifactLoader::new().load(&descriptor(dir.path()), Device::Cpu).unwrap();

        let huge = GenerationInput {
            prompts: vec!["hello".to_string(); 4],
            params: SamplingParams {
                max_length: u32::MAX,
                num_sequences: 16,
                ..SamplingParams::default()
            },
        };
        assert_eq!(wide.model.workspace_bytes(&[huge.clone(), huge]), u64::MAX);
    }

    #[test]
    fn test_artifact_loader_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path());
        std::fs::write(dir.path().join(CONFIG_FILE), "not json").unwrap();

        let result = ArtifactLoader::new().load(&descriptor(dir.path()), Device::Cpu);
        assert!(matches!(result, Err(ServeError::LoadFailed(_))));
    }
}
