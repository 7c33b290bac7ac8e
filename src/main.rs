use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use toolbox_extension_lib::config::{ExtensionConfig, load_extension_config, save_extension_config};
use toolbox_extension_lib::native::{NativeClient, StdioTransport};
use toolbox_extension_lib::origin::Origin;
use toolbox_extension_lib::providers::{Provider, ProviderKind};
use toolbox_extension_lib::storage::{JsonFileStore, Storage};
use toolbox_extension_lib::toolbox_url::{get_toolbox_clone_url, get_toolbox_navigate_url};
use toolbox_extension_lib::tools::resolve_tools;

#[derive(Parser)]
#[command(name = "toolbox-extension")]
#[command(about = "Open repositories from code-hosting pages in JetBrains IDEs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Native host manifest of the Toolbox App (skips the directory search)
    #[arg(long, global = true, env = "TOOLBOX_HOST_MANIFEST")]
    manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the Toolbox App answers on the native channel
    Probe,
    /// List the IDEs the Toolbox App has installed
    InstalledTools,
    /// Resolve the IDEs to offer for a repository page
    Tools {
        /// e.g. https://github.com/JetBrains/kotlin
        repo_url: String,
    },
    /// Print the jetbrains:// clone URL
    CloneUrl { tool: String, clone_url: String },
    /// Print the jetbrains:// navigate URL (line is one-based)
    NavigateUrl {
        tool: String,
        project: String,
        path: String,
        line: Option<u32>,
    },
    /// Show or edit the configuration file
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Print the persisted extension state (protocol, grants, ...)
    State,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Treat a custom domain as an installation of a hosting service
    AddSelfHosted {
        /// e.g. https://git.corp.example
        url: String,
        /// github, gitlab, bitbucket or gitee
        kind: ProviderKind,
    },
    /// Send a provider's REST calls to another API base (omit to reset)
    SetApiBase { kind: ProviderKind, base: Option<String> },
}

fn native_client(config: &ExtensionConfig, manifest: Option<PathBuf>) -> NativeClient {
    let manifest = manifest.or_else(|| config.native_host_manifest.clone());
    let transport = StdioTransport::new(manifest, config.extension_origin.clone());
    NativeClient::new(Arc::new(transport))
}

async fn resolve_repo_tools(config: &ExtensionConfig, repo_url: &str) -> Result<()> {
    let origin = Origin::from_url(repo_url).ok_or_else(|| anyhow!("Not an http(s) URL: {repo_url}"))?;
    let kind = config
        .self_hosted_kind(&origin)
        .or_else(|| ProviderKind::from_hostname(origin.host()))
        .ok_or_else(|| anyhow!("Cannot tell which hosting service {origin} runs"))?;
    let provider = Provider::for_kind(kind, &origin, config).map_err(|e| anyhow!(e))?;
    let adapter = provider.adapter();
    let source = adapter
        .languages_source_for_url(repo_url)
        .ok_or_else(|| anyhow!("{repo_url} is not a {kind} repository URL"))?;

    let languages = adapter
        .fetch_languages(&source)
        .await
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Failed to fetch languages from {source}"))?;
    for language in &languages {
        tracing::debug!(target: "cli", "{} {:.1}%", language.name, language.percentage);
    }
    println!("{}", serde_json::to_string_pretty(&resolve_tools(&languages))?);
    Ok(())
}

fn edit_config(mut config: ExtensionConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {}
        ConfigAction::AddSelfHosted { url, kind } => {
            let origin = Origin::from_url(&url).ok_or_else(|| anyhow!("Not an http(s) URL: {url}"))?;
            config.add_self_hosted(origin, kind);
            save_extension_config(&config).map_err(|e| anyhow!(e))?;
        }
        ConfigAction::SetApiBase { kind, base } => {
            config.set_api_base(kind, base);
            save_extension_config(&config).map_err(|e| anyhow!(e))?;
        }
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_extension_config();

    match cli.command {
        Commands::Probe => {
            let state = native_client(&config, cli.manifest).probe().await;
            println!("{}", state.label());
        }
        Commands::InstalledTools => {
            let tools = native_client(&config, cli.manifest)
                .get_installed_tools()
                .await
                .context("get-installed-tools failed")?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
        Commands::Tools { repo_url } => resolve_repo_tools(&config, &repo_url).await?,
        Commands::CloneUrl { tool, clone_url } => {
            if clone_url.trim().is_empty() {
                bail!("Clone URL must not be empty");
            }
            println!("{}", get_toolbox_clone_url(&tool, &clone_url));
        }
        Commands::NavigateUrl {
            tool,
            project,
            path,
            line,
        } => println!("{}", get_toolbox_navigate_url(&tool, &project, &path, line)),
        Commands::Config { action } => edit_config(config, action.unwrap_or(ConfigAction::Show))?,
        Commands::State => {
            let storage = Storage::open(Arc::new(JsonFileStore::in_config_dir())).map_err(|e| anyhow!(e))?;
            println!("{}", serde_json::to_string_pretty(&storage.snapshot())?);
        }
    }
    Ok(())
}
