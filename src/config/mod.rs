use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;
use crate::research::{ExecutionMode, LiteratureSource, ResearchMode};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub research: ResearchConfig,
    pub queue: QueueConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe names for every research agent
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub planner: String,
    pub hypothesis: String,
    pub reflection: String,
    pub discovery: String,
    pub continuation: String,
    pub reply: String,
    pub analysis: String,
    /// One pipe per enabled literature source, in configuration order.
    pub literature: Vec<LiteraturePipe>,
}

/// Pipe backing a single literature source
#[derive(Debug, Clone, PartialEq)]
pub struct LiteraturePipe {
    pub source: LiteratureSource,
    pub pipe: String,
}

/// Iteration engine configuration
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub execution_mode: ExecutionMode,
    pub default_research_mode: ResearchMode,
    /// Auto-iteration cap for semi-autonomous runs.
    pub semi_autonomous_max_iterations: u32,
    pub discovery: DiscoveryConfig,
    pub run_lock_ttl_ms: u64,
    pub run_lock_wait_ms: u64,
}

/// Thresholds for the discovery cost-control policy
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Conversation messages required before literature-only batches qualify.
    pub min_messages: usize,
    /// Completed literature tasks required in a batch without analysis.
    pub min_tasks: usize,
}

/// Durable job queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub stalled_after_secs: u64,
    /// Run queue workers inside the `serve` process.
    pub embedded_workers: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/research.db".to_string()),
            ),
            max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_or("REQUEST_TIMEOUT_MS", 30000),
            max_retries: parse_or("MAX_RETRIES", 3),
            retry_delay_ms: parse_or("RETRY_DELAY_MS", 1000),
        };

        let research = ResearchConfig {
            execution_mode: parse_enum("EXECUTION_MODE", ExecutionMode::Inline)?,
            default_research_mode: parse_enum(
                "DEFAULT_RESEARCH_MODE",
                ResearchMode::SemiAutonomous,
            )?,
            semi_autonomous_max_iterations: parse_or(
                "MAX_AUTO_ITERATIONS",
                crate::research::DEFAULT_SEMI_AUTONOMOUS_ITERATIONS,
            ),
            discovery: DiscoveryConfig {
                min_messages: parse_or("DISCOVERY_MIN_MESSAGES", 2),
                min_tasks: parse_or("DISCOVERY_MIN_TASKS", 2),
            },
            run_lock_ttl_ms: parse_or("RUN_LOCK_TTL_MS", 30000),
            run_lock_wait_ms: parse_or("RUN_LOCK_WAIT_MS", 2000),
        };

        let sources = parse_literature_sources(
            &env::var("LITERATURE_SOURCES").unwrap_or_else(|_| "openscholar,knowledge".to_string()),
        )?;

        let pipes = PipeConfig {
            planner: env::var("PIPE_PLANNER").unwrap_or_else(|_| "research-planner-v1".to_string()),
            hypothesis: env::var("PIPE_HYPOTHESIS")
                .unwrap_or_else(|_| "research-hypothesis-v1".to_string()),
            reflection: env::var("PIPE_REFLECTION")
                .unwrap_or_else(|_| "research-reflection-v1".to_string()),
            discovery: env::var("PIPE_DISCOVERY")
                .unwrap_or_else(|_| "research-discovery-v1".to_string()),
            continuation: env::var("PIPE_CONTINUATION")
                .unwrap_or_else(|_| "research-continuation-v1".to_string()),
            reply: env::var("PIPE_REPLY").unwrap_or_else(|_| "research-reply-v1".to_string()),
            analysis: env::var("PIPE_ANALYSIS")
                .unwrap_or_else(|_| "research-analysis-v1".to_string()),
            literature: sources
                .into_iter()
                .map(|source| LiteraturePipe {
                    pipe: env::var(format!(
                        "PIPE_LITERATURE_{}",
                        source.as_str().to_uppercase()
                    ))
                    .unwrap_or_else(|_| source.default_pipe()),
                    source,
                })
                .collect(),
        };

        let queue = QueueConfig {
            worker_concurrency: parse_or("QUEUE_WORKER_CONCURRENCY", 2),
            poll_interval_ms: parse_or("QUEUE_POLL_INTERVAL_MS", 500),
            stalled_after_secs: parse_or("QUEUE_STALLED_AFTER_SECS", 900),
            embedded_workers: parse_or("QUEUE_EMBEDDED_WORKERS", true),
        };

        Ok(Config {
            langbase,
            database,
            logging,
            request,
            pipes,
            research,
            queue,
        })
    }
}

/// Parse a numeric/boolean variable, falling back to `default` when unset or malformed.
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse an enumerated variable; an unrecognised value is a configuration error.
fn parse_enum<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr<Err = String>,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| AppError::Config {
            message: format!("{}: {}", key, e),
        }),
        _ => Ok(default),
    }
}

/// Parse a comma separated list of literature sources.
pub fn parse_literature_sources(raw: &str) -> Result<Vec<LiteratureSource>, AppError> {
    let mut sources = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let source: LiteratureSource = item.parse().map_err(|e| AppError::Config {
            message: format!("LITERATURE_SOURCES: {}", e),
        })?;
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    if sources.is_empty() {
        return Err(AppError::Config {
            message: "LITERATURE_SOURCES must name at least one source".to_string(),
        });
    }

    Ok(sources)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            planner: "research-planner-v1".to_string(),
            hypothesis: "research-hypothesis-v1".to_string(),
            reflection: "research-reflection-v1".to_string(),
            discovery: "research-discovery-v1".to_string(),
            continuation: "research-continuation-v1".to_string(),
            reply: "research-reply-v1".to_string(),
            analysis: "research-analysis-v1".to_string(),
            literature: vec![
                LiteraturePipe {
                    source: LiteratureSource::OpenScholar,
                    pipe: LiteratureSource::OpenScholar.default_pipe(),
                },
                LiteraturePipe {
                    source: LiteratureSource::Knowledge,
                    pipe: LiteratureSource::Knowledge.default_pipe(),
                },
            ],
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_messages: 2,
            min_tasks: 2,
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Inline,
            default_research_mode: ResearchMode::SemiAutonomous,
            semi_autonomous_max_iterations: crate::research::DEFAULT_SEMI_AUTONOMOUS_ITERATIONS,
            discovery: DiscoveryConfig::default(),
            run_lock_ttl_ms: 30000,
            run_lock_wait_ms: 2000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            poll_interval_ms: 500,
            stalled_after_secs: 900,
            embedded_workers: true,
        }
    }
}
