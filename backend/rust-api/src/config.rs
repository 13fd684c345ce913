use serde::Deserialize;
use std::env;

/// Which judgment backend the grading pipeline prefers. Selection is explicit
/// configuration, resolved once at startup; the fallback chain (preferred
/// provider, then Gemini when a key is present, then the deterministic
/// heuristic) is built from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeProvider {
    Ollama,
    OpenAi,
    Anthropic,
    Gemini,
    None,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: String,
    /// Judge0-compatible sandbox endpoint. When unset, only the local Python
    /// executor is available.
    pub sandbox_url: Option<String>,
    pub sandbox_api_key: Option<String>,
    pub judge_provider: JudgeProvider,
    pub judge_url: String,
    pub judge_model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    /// Upper bound on concurrent background grading tasks.
    pub grading_concurrency: usize,
    /// Grading deadline after which an attempt is marked failed.
    pub grading_deadline_secs: u64,
    /// Seat bound used when an exam declares no layout.
    pub default_max_serial: u32,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let env_name = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env_name)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let data_dir = settings
            .get_string("storage.data_dir")
            .or_else(|_| env::var("LABSENSE_DATA_DIR"))
            .unwrap_or_else(|_| "data".to_string());

        let sandbox_url = settings
            .get_string("sandbox.url")
            .or_else(|_| env::var("LABSENSE_SANDBOX_URL"))
            .ok();
        let sandbox_api_key = settings
            .get_string("sandbox.api_key")
            .or_else(|_| env::var("LABSENSE_SANDBOX_API_KEY"))
            .ok();

        let provider_name = settings
            .get_string("judge.provider")
            .or_else(|_| env::var("LABSENSE_JUDGE_PROVIDER"))
            .unwrap_or_else(|_| "ollama".to_string());
        let judge_provider = match provider_name.to_lowercase().as_str() {
            "ollama" | "local" => JudgeProvider::Ollama,
            "openai" => JudgeProvider::OpenAi,
            "anthropic" => JudgeProvider::Anthropic,
            "gemini" => JudgeProvider::Gemini,
            "none" => JudgeProvider::None,
            other => {
                tracing::warn!("unknown judge provider '{}', falling back to ollama", other);
                JudgeProvider::Ollama
            }
        };

        let judge_url = settings
            .get_string("judge.url")
            .or_else(|_| env::var("LABSENSE_LLM_URL"))
            .unwrap_or_else(|_| "http://localhost:11434".to_string());

        let judge_model = settings
            .get_string("judge.model")
            .or_else(|_| env::var("LABSENSE_LLM_MODEL"))
            .unwrap_or_else(|_| default_model(judge_provider).to_string());

        let openai_api_key = env::var("OPENAI_API_KEY").ok();
        let anthropic_api_key = env::var("ANTHROPIC_API_KEY").ok();
        let gemini_api_key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("GOOGLE_API_KEY"))
            .ok();

        let grading_concurrency = settings
            .get_int("grading.concurrency")
            .ok()
            .or_else(|| {
                env::var("LABSENSE_GRADING_CONCURRENCY")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .filter(|v| *v > 0)
            .unwrap_or(8) as usize;

        let grading_deadline_secs = settings
            .get_int("grading.deadline_secs")
            .ok()
            .filter(|v| *v > 0)
            .unwrap_or(120) as u64;

        let default_max_serial = settings
            .get_int("seating.default_max_serial")
            .ok()
            .filter(|v| *v > 0)
            .unwrap_or(50) as u32;

        Ok(Config {
            bind_addr,
            data_dir,
            sandbox_url,
            sandbox_api_key,
            judge_provider,
            judge_url,
            judge_model,
            openai_api_key,
            anthropic_api_key,
            gemini_api_key,
            grading_concurrency,
            grading_deadline_secs,
            default_max_serial,
        })
    }
}

fn default_model(provider: JudgeProvider) -> &'static str {
    match provider {
        JudgeProvider::Ollama => "llama3.1:8b",
        JudgeProvider::OpenAi => "gpt-4o-mini",
        JudgeProvider::Anthropic => "claude-3-5-sonnet-20241022",
        JudgeProvider::Gemini => "gemini-2.5-flash",
        JudgeProvider::None => "",
    }
}
