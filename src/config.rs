use anyhow::Context;
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::engine::GenerationOptions;

/// Gateway settings; each flag can also come from the environment or `.env`.
#[derive(Debug, Clone, Args)]
pub struct GatewayConfig {
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// GGUF model file served by the gateway
    #[arg(long, env = "MODEL_PATH", default_value = "models/llama-2-7b-chat.gguf")]
    pub model_path: PathBuf,

    /// Name echoed in responses when a request omits `model`
    #[arg(long, env = "MODEL_NAME", default_value = "llama-local")]
    pub model_name: String,

    #[arg(long, env = "DEFAULT_MAX_TOKENS", default_value_t = 2048)]
    pub default_max_tokens: u32,

    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value_t = 0.7)]
    pub default_temperature: f32,

    /// Layers offloaded to the GPU
    #[arg(long, env = "GPU_LAYERS", default_value_t = 0)]
    pub gpu_layers: u32,

    /// Require this key in `x-api-key` or `Authorization` on completion routes
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// llama.cpp CLI binary, resolved through PATH when not absolute
    #[arg(long, env = "LLAMA_BIN", default_value = "llama-cli")]
    pub llama_bin: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            model_path: PathBuf::from("models/llama-2-7b-chat.gguf"),
            model_name: "llama-local".to_string(),
            default_max_tokens: 2048,
            default_temperature: 0.7,
            gpu_layers: 0,
            api_key: None,
            llama_bin: PathBuf::from("llama-cli"),
        }
    }
}

impl GatewayConfig {
    /// Listen address; `host` may be a name such as `localhost`.
    pub async fn resolve_addr(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to resolve host {}", self.host))?
            .next()
            .with_context(|| format!("No address found for host {}", self.host))
    }

    /// Request options, falling back to the configured defaults.
    pub fn options(&self, max_tokens: Option<u32>, temperature: Option<f32>) -> GenerationOptions {
        GenerationOptions {
            max_tokens: max_tokens
                .filter(|&n| n > 0)
                .unwrap_or(self.default_max_tokens),
            temperature: temperature.unwrap_or(self.default_temperature),
        }
    }

    /// Empty keys count as unset.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.is_empty())
    }
}
