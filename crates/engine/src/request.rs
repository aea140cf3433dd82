//! Generation requests and results
//!
//! Requests carry typed sampling parameters that are validated before the
//! request may enter the scheduler.

use modelserve_common::{Result, ServeError};
use modelserve_proto::{GenerateRequest, GenerateResponse};
use std::time::{Duration, Instant};

/// Upper bound on sequences returned per prompt
pub const MAX_SEQUENCES: u32 = 16;

/// Request identifier
pub type RequestId = String;

/// Sampling parameters for one request
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Maximum total length in tokens, prompt included
    pub max_length: u32,

    /// Sampling temperature, within [0, 2]
    pub temperature: f32,

    /// Nucleus sampling mass, within (0, 1]
    pub top_p: f32,

    /// Top-k cutoff (0 disables the cutoff)
    pub top_k: u32,

    /// Sequences returned per prompt
    pub num_sequences: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_length: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            num_sequences: 1,
        }
    }
}

impl SamplingParams {
    /// Reject out-of-range parameters
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(ServeError::validation(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(ServeError::validation(format!(
                "top_p {} outside (0, 1]",
                self.top_p
            )));
        }
        if self.max_length == 0 {
            return Err(ServeError::validation("max_length must be positive"));
        }
        if self.num_sequences == 0 || self.num_sequences > MAX_SEQUENCES {
            return Err(ServeError::validation(format!(
                "num_sequences {} outside [1, {}]",
                self.num_sequences, MAX_SEQUENCES
            )));
        }
        Ok(())
    }

    /// Hashable form used in cache keys
    pub fn key(&self) -> ParamsKey {
        ParamsKey {
            max_length: self.max_length,
            temperature_bits: self.temperature.to_bits(),
            top_p_bits: self.top_p.to_bits(),
            top_k: self.top_k,
            num_sequences: self.num_sequences,
        }
    }
}

/// Frozen, hashable view of [`SamplingParams`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamsKey {
    max_length: u32,
    temperature_bits: u32,
    top_p_bits: u32,
    top_k: u32,
    num_sequences: u32,
}

/// A text-generation request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request identifier
    pub request_id: RequestId,

    /// Ordered prompts
    pub prompts: Vec<String>,

    /// Target model (None = engine default)
    pub model_name: Option<String>,

    /// Target version (None = latest)
    pub version: Option<String>,

    /// Sampling parameters
    pub params: SamplingParams,

    /// Request arrival time
    pub submitted_at: Instant,
}

impl GenerationRequest {
    /// Create a request against the engine's default model
    pub fn new(prompts: Vec<String>, params: SamplingParams) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            prompts,
            model_name: None,
            version: None,
            params,
            submitted_at: Instant::now(),
        }
    }

    /// Target a specific model and optional version
    pub fn with_model(mut self, name: impl Into<String>, version: Option<&str>) -> Self {
        self.model_name = Some(name.into());
        self.version = version.map(str::to_string);
        self
    }

    /// Validate prompts and sampling parameters
    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(ServeError::validation("at least one prompt is required"));
        }
        self.params.validate()
    }
}

impl From<GenerateRequest> for GenerationRequest {
    fn from(request: GenerateRequest) -> Self {
        let params = SamplingParams {
            max_length: request.max_length,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            num_sequences: request.num_return_sequences,
        };

        let mut converted = GenerationRequest::new(request.prompt.into_vec(), params);
        converted.model_name = request.model_name;
        converted.version = request.version;
        converted
    }
}

/// Result delivered to a request
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Generated texts in prompt order
    pub texts: Vec<String>,

    /// Model that served the request
    pub model_name: String,

    /// Resolved version
    pub version: String,

    /// Time from submission to completion
    pub latency: Duration,

    /// Tokens in the generated texts
    pub token_count: u64,

    /// Served from the response cache
    pub cached: bool,
}

impl From<GenerationResult> for GenerateResponse {
    fn from(result: GenerationResult) -> Self {
        GenerateResponse {
            generated_text: result.texts,
            model_name: result.model_name,
            version: result.version,
            generation_time: result.latency.as_secs_f64(),
            token_count: result.token_count,
            cached: result.cached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_bounds() {
        let mut params = SamplingParams::default();
        for ok in [0.0, 0.5, 2.0] {
            params.temperature = ok;
            assert!(params.validate().is_ok());
        }
        for bad in [-0.1, 2.01, f32::NAN] {
            params.temperature = bad;
            assert!(matches!(params.validate(), Err(ServeError::Validation(_))));
        }
    }

    #[test]
    fn test_other_bounds() {
        let params = SamplingParams {
            top_p: 0.0,
            ..SamplingParams::default()
        };
        assert!(params.validate().is_err());

        let params = SamplingParams {
            num_sequences: MAX_SEQUENCES + 1,
            ..SamplingParams::default()
        };
        assert!(params.validate().is_err());

        let params = SamplingParams {
            max_length: 0,
            ..SamplingParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_empty_prompts_rejected() {
        let request = GenerationRequest::new(Vec::new(), SamplingParams::default());
        assert!(matches!(request.validate(), Err(ServeError::Validation(_))));
    }

    #[test]
    fn test_params_key_distinguishes_temperature() {
        let a = SamplingParams {
            temperature: 0.5,
            ..SamplingParams::default()
        };
        let b = SamplingParams {
            temperature: 0.9,
            ..SamplingParams::default()
        };
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.clone().key());
    }

    #[test]
    fn test_from_gateway_request() {
        let gateway = GenerateRequest::new("hello")
            .with_model("demo", Some("1.0".to_string()))
            .with_temperature(0.3);
        let request = GenerationRequest::from(gateway);

        assert_eq!(request.prompts, vec!["hello".to_string()]);
        assert_eq!(request.model_name.as_deref(), Some("demo"));
        assert_eq!(request.version.as_deref(), Some("1.0"));
        assert_eq!(request.params.temperature, 0.3);
    }
}
