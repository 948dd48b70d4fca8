//! waPC runtime CLI entry point.
//!
//! Loads guest modules described by a TOML config file (or a single module
//! given on the command line) and invokes one of their operations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wapc_runtime_common::{ConfigFile, ModuleLoadSpec};
use wapc_runtime_host::{CallbackRouter, CapabilityPolicy, LoggingHooks, RouterConfig, hooks};
use wapc_runtime_registry::ModuleRegistry;

#[derive(Debug, Parser)]
#[command(name = "wapc-runtime", version, about = "Run waPC guest modules")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "WAPC_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invoke one operation of a module and print the response.
    Invoke {
        /// Name of the module to invoke.
        module: String,

        /// Guest operation to call.
        function: String,

        /// Payload passed to the guest as UTF-8 text.
        #[arg(long, default_value = "")]
        payload: String,

        /// Load the module from this path instead of the config file.
        #[arg(long)]
        module_path: Option<PathBuf>,

        /// Instance pool size for a module given by `--module-path`.
        #[arg(long, default_value_t = 0)]
        pool_size: usize,
    },

    /// Load every configured module and list it.
    Modules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wapc_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let router = Arc::new(build_router(&config)?);
    let registry = ModuleRegistry::from_config(&config.runtime, router.clone())
        .context("Failed to create execution engine")?;

    let result = run(&cli.command, &config, &registry).await;

    registry.close_all();
    router.close();
    result
}

async fn run(
    command: &Command,
    config: &ConfigFile,
    registry: &ModuleRegistry,
) -> anyhow::Result<()> {
    match command {
        Command::Invoke {
            module,
            function,
            payload,
            module_path,
            pool_size,
        } => {
            let spec = match module_path {
                Some(path) => ModuleLoadSpec::new(module.as_str(), path.to_string_lossy())
                    .with_pool_size(*pool_size),
                None => match config.module(module) {
                    Some(spec) => spec.clone(),
                    None => bail!("module '{module}' is not configured; pass --module-path"),
                },
            };

            registry
                .load_module(spec)
                .await
                .with_context(|| format!("Failed to load module '{module}'"))?;

            let output = registry
                .invoke(module, function, payload.as_bytes())
                .await
                .with_context(|| format!("Invocation of '{module}.{function}' failed"))?;

            println!("{}", String::from_utf8_lossy(&output));
        }
        Command::Modules => {
            for spec in &config.modules {
                registry
                    .load_module(spec.clone())
                    .await
                    .with_context(|| format!("Failed to load module '{}'", spec.name))?;
            }

            for name in registry.list_modules() {
                let module = registry.get_module(&name)?;
                println!(
                    "{name}\t{}\tpool_size={}",
                    module.source_path().display(),
                    module.pool().size()
                );
            }
            info!(count = registry.len(), "Modules loaded");
        }
    }
    Ok(())
}

fn build_router(config: &ConfigFile) -> anyhow::Result<CallbackRouter> {
    let logging = LoggingHooks::new();
    let mut router_config = logging.install(RouterConfig::new());

    let policy =
        CapabilityPolicy::from_config(&config.policy).context("Invalid [policy] section")?;
    if let Some(policy) = policy {
        info!(patterns = policy.patterns().len(), "Capability policy enabled");
        let pre_hook = hooks::chain([logging.pre_hook(), policy.into_pre_hook()]);
        router_config = router_config.with_shared_pre_hook(pre_hook);
    }

    Ok(CallbackRouter::new(router_config))
}
