//! OfflineKit smoke harness
//!
//! Registers the caching worker against a live origin, lets it install and
//! activate, optionally replays a few page requests through it, and prints a
//! JSON summary of what ended up cached.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use offline_common::{init_logging, LogConfig, LogFormat, OfflineError};
use offline_net::{LoaderConfig, Request, ResourceLoader};
use offline_sw::{
    CacheStorage, MemoryCacheStorage, NetworkScriptLoader, RegistrationOptions, ScriptLoader,
    ServiceWorkerContainer, ServiceWorkerError, StaticScriptLoader, WorkerConfig,
};
use serde_json::json;
use tracing::{error, info};
use url::Url;

/// Parse command line arguments
struct Args {
    origin: Option<String>,
    script: String,
    config: Option<String>,
    checks: Vec<String>,
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    verbosity: u8,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut origin = None;
        let mut script = "/sw.js".to_string();
        let mut config = None;
        let mut checks = Vec::new();
        let mut log_format = None;
        let mut log_filter = None;
        let mut verbosity = 0u8;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--origin" => {
                    origin = args.next();
                }
                "--script" => {
                    if let Some(val) = args.next() {
                        script = val;
                    }
                }
                "--config" => {
                    config = args.next();
                }
                "--check" => {
                    if let Some(val) = args.next() {
                        checks.push(val);
                    }
                }
                "--log-format" => {
                    if let Some(val) = args.next() {
                        log_format = val.parse().ok();
                    }
                }
                "--log-filter" => {
                    log_filter = args.next();
                }
                "--verbose" | "-v" => {
                    verbosity = verbosity.saturating_add(1);
                }
                "-vv" => {
                    verbosity = verbosity.saturating_add(2);
                }
                _ => {}
            }
        }

        Self {
            origin,
            script,
            config,
            checks,
            log_format,
            log_filter,
            verbosity,
        }
    }

    fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::from_env().with_verbosity(self.verbosity);
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        match &self.log_filter {
            Some(filter) => config.with_filter(filter.clone()),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_config());

    let start = Instant::now();
    match run(&args).await {
        Ok(mut summary) => {
            summary["status"] = json!("pass");
            summary["elapsed_ms"] = json!(start.elapsed().as_millis());
            println!("{}", summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Smoke run failed");
            let result = json!({
                "status": "fail",
                "error": e.to_string(),
                "elapsed_ms": start.elapsed().as_millis(),
            });
            println!("{}", result);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<serde_json::Value, ServiceWorkerError> {
    let origin = args
        .origin
        .as_deref()
        .ok_or_else(|| OfflineError::config("--origin <url> is required"))?;
    let origin = Url::parse(origin)
        .map_err(|e| OfflineError::config_with_source("invalid --origin", e))?;
    let script_url = origin
        .join(&args.script)
        .map_err(|e| OfflineError::config_with_source("invalid --script", e))?;

    let loader = Arc::new(ResourceLoader::new(LoaderConfig::default())?);
    let scripts: Arc<dyn ScriptLoader> = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(OfflineError::from)?;
            let config = WorkerConfig::from_json(&json)?;
            info!(path = %path, precache = %config.precache_name, "Using local worker config");
            Arc::new(StaticScriptLoader::new().with_script(script_url.as_str(), config))
        }
        None => Arc::new(NetworkScriptLoader::new(loader.clone())),
    };

    let storage = Arc::new(MemoryCacheStorage::new());
    let (container, _events) = ServiceWorkerContainer::new(loader, scripts, storage.clone());

    let handle = container
        .register(
            script_url.as_str(),
            RegistrationOptions {
                scope: Some("/".to_string()),
            },
        )
        .await?;
    info!(scope = %handle.scope, outcome = ?handle.outcome, "Worker ready");

    let mut checks = Vec::new();
    if !args.checks.is_empty() {
        let page = container.add_client(origin.as_str()).await?;
        for path in &args.checks {
            let url = origin
                .join(path)
                .map_err(|e| OfflineError::config_with_source("invalid --check", e))?;
            let result = match container.handle_fetch(&page, &Request::get(url.clone())).await {
                Ok(decision) => json!({
                    "url": url.as_str(),
                    "source": decision.source().map(|s| format!("{s:?}")),
                    "status": decision.response().map(|r| r.status),
                }),
                Err(e) => json!({ "url": url.as_str(), "error": e.to_string() }),
            };
            checks.push(result);
        }
    }
    container.wait_idle().await;

    let mut caches = serde_json::Map::new();
    for name in storage.keys().await? {
        let urls: Vec<String> = storage
            .entries(&name)
            .await?
            .iter()
            .map(|key| key.url().to_string())
            .collect();
        caches.insert(name, json!(urls));
    }

    Ok(json!({
        "scope": handle.scope,
        "registration": container.registration_info(&handle.scope).await,
        "caches": caches,
        "checks": checks,
    }))
}
