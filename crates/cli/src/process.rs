//! `cogworks process` and `cogworks validate`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Args;
use tracing::{info, warn};

use extension_api::{ExtensionApiClient, ServiceRegistry};
use github::{GithubArtifactStore, GithubClient, GithubToken, DEFAULT_API_URL};
use llm::{AnthropicConfig, AnthropicProvider, ApiKey};
use nodes::PipelineExecutor;
use pipeline::{PipelineConfig, RepositoryContext, WorkItemRef};

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Work item, as `owner/repo#42` or an issue URL.
    pub work_item: String,

    /// Checkout the domain services operate on.
    #[arg(long, default_value = ".")]
    pub repository_path: String,

    /// Git ref of that checkout.
    #[arg(long, default_value = "HEAD")]
    pub git_ref: String,

    /// Reasoning model.
    #[arg(long, env = "COGWORKS_MODEL")]
    pub model: Option<String>,

    /// GitHub API root (GitHub Enterprise: `https://host/api/v3`).
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub github_api_url: String,

    /// Account whose comments are trusted as run records. Required with
    /// GitHub App installation tokens (`<app-slug>[bot]`).
    #[arg(long, env = "COGWORKS_ENGINE_LOGIN")]
    pub engine_login: Option<String>,
}

/// Runs one invocation and returns the process exit code.
pub async fn run(config_path: &Path, services_path: &Path, args: ProcessArgs) -> anyhow::Result<i32> {
    let item = WorkItemRef::parse(&args.work_item)?;
    let config = load_config(config_path)?;
    let registry = load_services(services_path)?;

    let Some(token) = GithubToken::from_env() else {
        bail!("{} is not set", github::token::TOKEN_ENV);
    };
    let Some(api_key) = ApiKey::from_env() else {
        bail!("{} is not set", llm::secret::API_KEY_ENV);
    };

    let client = GithubClient::new(&args.github_api_url, token)?;
    let mut store = GithubArtifactStore::new(client);
    if let Some(login) = args.engine_login {
        store = store.with_engine_login(login);
    }

    let mut llm_config = AnthropicConfig::new(api_key);
    if let Some(model) = args.model {
        llm_config = llm_config.with_model(model);
    }

    let executor = PipelineExecutor::new(
        Arc::new(store),
        Arc::new(AnthropicProvider::new(llm_config)),
        Arc::new(ExtensionApiClient::new(registry)),
        config,
    )
    .with_repository(RepositoryContext {
        path: args.repository_path,
        git_ref: args.git_ref,
    });

    let result = executor.advance(&item).await?;
    println!("{result}");
    Ok(result.exit_code())
}

/// Loads both files and describes what they declare.
pub fn validate(config_path: &Path, services_path: &Path) -> anyhow::Result<String> {
    let config = load_config(config_path)?;
    let registry = load_services(services_path)?;
    let names: Vec<&str> = config.pipelines.iter().map(|p| p.name.as_str()).collect();
    Ok(format!(
        "{}: {} pipeline(s) [{}], default '{}'; {} domain service(s)",
        config_path.display(),
        names.len(),
        names.join(", "),
        config.default_pipeline,
        registry.len()
    ))
}

fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = PipelineConfig::from_toml(&text).with_context(|| format!("in {}", path.display()))?;
    info!(path = %path.display(), pipelines = config.pipelines.len(), "Loaded pipeline configuration");
    Ok(config)
}

/// A missing registry is an empty one: pipelines without tool nodes need none.
fn load_services(path: &Path) -> anyhow::Result<ServiceRegistry> {
    if !path.exists() {
        warn!(path = %path.display(), "No domain service registry; tool nodes will fail");
        return Ok(ServiceRegistry::default());
    }
    Ok(ServiceRegistry::load(path)?)
}
