use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::EngineConfig;
use crate::crawler::controller::CrawlerController;
use crate::crawler::task::{TaskSettings, TaskStatus, TaskType, PAGINATED_API};
use crate::error::CrawlError;
use crate::events::TaskEvents;
use crate::proxy::manager::ProxyManager;
use crate::storage::models::{NewProxy, NewTask, ProxyScheme};
use crate::storage::postgres::PostgresRepository;
use crate::storage::Repository;

async fn connect(config: &EngineConfig) -> Result<Arc<dyn Repository>> {
    let repo = PostgresRepository::connect(&config.storage)
        .await
        .context("Failed to connect to the database")?;
    Ok(Arc::new(repo))
}

/// Split `name=value` header arguments
fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once('=')
                .with_context(|| format!("Header must look like name=value: {}", header))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Create a new task
pub async fn create_task(
    config: &EngineConfig,
    name: String,
    url: String,
    task_type: String,
    paginated: bool,
    headers: Vec<String>,
) -> Result<()> {
    let task_type: TaskType = task_type.parse()?;
    url::Url::parse(&url).context(format!("Invalid URL: {}", url))?;

    let settings = TaskSettings {
        crawler_type: paginated.then(|| PAGINATED_API.to_string()),
        headers: parse_headers(&headers)?,
        ..TaskSettings::default()
    };

    let repo = connect(config).await?;
    let task = repo
        .create_task(NewTask {
            name,
            url,
            task_type,
            config: settings.to_json()?,
        })
        .await?;

    println!("Created task {} ({})", task.id, task.name);
    println!("Use `crawler start {}` to run it", task.id);
    Ok(())
}

/// Print a page of tasks
pub async fn list_tasks(config: &EngineConfig, limit: i64, offset: i64) -> Result<()> {
    let repo = connect(config).await?;
    let tasks = repo.list_tasks(limit, offset).await?;

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!("{:<6} {:<10} {:<5} {:<24} {}", "ID", "STATUS", "TYPE", "NAME", "URL");
    for task in tasks {
        let cursor = task
            .settings()
            .ok()
            .and_then(|s| s.last_from)
            .map(|from| format!(" (resume at {})", from))
            .unwrap_or_default();
        println!(
            "{:<6} {:<10} {:<5} {:<24} {}{}",
            task.id,
            task.status.as_str(),
            task.task_type.as_str(),
            task.name,
            task.url,
            cursor
        );
    }
    println!("\n{} products stored", repo.count_products().await?);
    Ok(())
}

/// Start or resume `task_id`, returning whether it keeps an incremental monitor.
///
/// A task marked running belongs to another process, or to one that died; the
/// latter needs `crawler recover` first.
async fn launch_task(controller: &CrawlerController, task_id: i64, resume: bool) -> Result<bool> {
    let current = controller.task(task_id).await?;
    let monitored = current.settings().map(|s| s.is_paginated()).unwrap_or(false);

    let launched = if resume || current.status == TaskStatus::Paused {
        controller.resume(task_id).await
    } else {
        controller.start(task_id).await
    };
    match launched {
        Ok(()) => Ok(monitored),
        Err(CrawlError::AlreadyRunning(_)) => anyhow::bail!(
            "Task {} is marked running, possibly by another crawler process. If that process died, run `crawler recover` first",
            task_id
        ),
        Err(e) => Err(e.into()),
    }
}

/// Pause every task left `running` by a crawler process that died
pub async fn recover(config: &EngineConfig) -> Result<()> {
    let repo = connect(config).await?;
    let controller = CrawlerController::new(config, repo, TaskEvents::default())?;

    let recovered = controller.recover_interrupted().await?;
    controller.shutdown().await;

    if recovered == 0 {
        println!("No interrupted tasks found");
    } else {
        println!("Paused {} interrupted task(s); use `crawler start <id> --resume` to continue", recovered);
    }
    Ok(())
}

/// Run a task in the foreground.
///
/// Returns once the run ends. A completed paginated task keeps its incremental
/// monitor alive until Ctrl-C. Ctrl-C pauses whatever is still running.
pub async fn start(config: &EngineConfig, task_id: i64, resume: bool) -> Result<()> {
    let repo = connect(config).await?;
    let controller = CrawlerController::new(config, Arc::clone(&repo), TaskEvents::default())?;

    let background = CancellationToken::new();
    let health_loop = match controller.proxy_manager() {
        Some(manager) => manager.start(background.clone()).await?,
        None => None,
    };

    let monitored = match launch_task(&controller, task_id, resume).await {
        Ok(monitored) => monitored,
        Err(e) => {
            controller.shutdown().await;
            background.cancel();
            return Err(e);
        }
    };
    info!("Task {} running, press Ctrl-C to pause", task_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received, pausing");
                break;
            }
            _ = ticker.tick() => {
                if controller.is_active(task_id) {
                    continue;
                }
                let task = controller.task(task_id).await?;
                if task.status == TaskStatus::Completed && monitored {
                    continue;
                }
                println!("Task {} finished with status {}", task_id, task.status);
                break;
            }
        }
    }

    controller.shutdown().await;
    background.cancel();
    if let Some(handle) = health_loop {
        if let Err(e) = handle.await {
            warn!("Proxy health loop ended abnormally: {}", e);
        }
    }
    Ok(())
}

/// Print all proxies
pub async fn list_proxies(config: &EngineConfig) -> Result<()> {
    let repo = connect(config).await?;
    let proxies = repo.list_proxies().await?;

    if proxies.is_empty() {
        println!("No proxies registered");
        return Ok(());
    }

    println!("{:<6} {:<7} {:<28} {:<7} {:<9} {}", "ID", "TYPE", "ADDRESS", "ACTIVE", "FAILURES", "LAST CHECKED");
    for proxy in proxies {
        let checked = proxy
            .last_checked
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<6} {:<7} {:<28} {:<7} {:<9} {}",
            proxy.id,
            proxy.proxy_type.as_str(),
            proxy.address(),
            proxy.is_active,
            proxy.failure_count,
            checked
        );
    }
    Ok(())
}

/// Register a proxy
pub async fn add_proxy(
    config: &EngineConfig,
    host: String,
    port: u16,
    proxy_type: String,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let proxy_type: ProxyScheme = proxy_type.parse()?;
    let repo = connect(config).await?;

    let proxy = repo
        .create_proxy(NewProxy {
            host,
            port,
            proxy_type,
            username,
            password,
        })
        .await?;

    println!("Added proxy {} ({})", proxy.id, proxy.address());
    Ok(())
}

/// Run one health check over the active proxies
pub async fn check_proxies(config: &EngineConfig) -> Result<()> {
    let repo = connect(config).await?;
    let manager = ProxyManager::new(config.proxy.clone(), config.crawler.request_timeout(), repo);

    let loaded = manager.reload().await?;
    if loaded == 0 {
        println!("No active proxies to check");
        return Ok(());
    }

    let report = manager.run_health_check().await?;
    println!(
        "Checked {} proxies: {} healthy, {} unhealthy, {} deactivated",
        loaded, report.healthy, report.unhealthy, report.deactivated
    );
    Ok(())
}

/// Print the payload overrides
pub async fn show_overrides(config: &EngineConfig) -> Result<()> {
    let repo = connect(config).await?;
    let overrides = repo.get_payload_overrides().await?;
    println!("{}", serde_json::to_string_pretty(&overrides)?);
    Ok(())
}

/// Replace the payload overrides from a JSON file
pub async fn set_overrides(config: &EngineConfig, file: &Path) -> Result<()> {
    let contents = fs::read_to_string(file)
        .context(format!("Failed to read overrides file: {}", file.display()))?;
    let overrides: Value = serde_json::from_str(&contents)
        .context(format!("Overrides file is not valid JSON: {}", file.display()))?;

    if !overrides.is_object() {
        anyhow::bail!("Overrides must be a JSON object");
    }
    if overrides.get("from").is_some() || overrides.get("size").is_some() {
        warn!("`from` and `size` in overrides are ignored; pagination controls them");
    }

    let repo = connect(config).await?;
    repo.update_payload_overrides(&overrides).await?;
    println!("Payload overrides updated");
    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &EngineConfig) -> Result<()> {
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Write a default configuration file
pub fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(EngineConfig::default_path);

    if path.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", path.display());
    }

    EngineConfig::default().save_to_file(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::strategy::Crawler;
    use crate::storage::memory::InMemoryRepository;
    use crate::storage::models::Task;
    use async_trait::async_trait;

    struct Instant;

    #[async_trait]
    impl Crawler for Instant {
        async fn crawl(&self, _token: &CancellationToken, _task: Task) -> Result<(), CrawlError> {
            Ok(())
        }
    }

    async fn web_task(repo: &InMemoryRepository, name: &str) -> Task {
        repo.create_task(NewTask {
            name: name.into(),
            url: "https://example.com".into(),
            task_type: TaskType::Web,
            config: String::new(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn launching_leaves_tasks_of_other_processes_running() {
        let repo = Arc::new(InMemoryRepository::new());
        let elsewhere = web_task(&repo, "owned by another process").await;
        let local = web_task(&repo, "local").await;
        repo.update_task_status(elsewhere.id, TaskStatus::Running).await.unwrap();

        let controller =
            CrawlerController::from_parts(repo.clone(), TaskEvents::default(), Arc::new(Instant), Arc::new(Instant), 1);

        let monitored = launch_task(&controller, local.id, false).await.unwrap();
        assert!(!monitored);
        assert_eq!(repo.get_task(elsewhere.id).await.unwrap().status, TaskStatus::Running);

        let err = launch_task(&controller, elsewhere.id, false).await.unwrap_err();
        assert!(err.to_string().contains("crawler recover"));
        assert_eq!(repo.get_task(elsewhere.id).await.unwrap().status, TaskStatus::Running);

        controller.shutdown().await;
    }

    #[test]
    fn headers_are_split_on_first_equals() {
        let headers = parse_headers(&["x-token = a=b".to_string(), "accept=text/html".to_string()]).unwrap();

        assert_eq!(headers["x-token"], "a=b");
        assert_eq!(headers["accept"], "text/html");
        assert!(parse_headers(&["broken".to_string()]).is_err());
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let path = std::env::temp_dir().join(format!("crawl-orchestrator-init-{}.yaml", std::process::id()));
        let _ = fs::remove_file(&path);

        init_config(Some(&path), false).unwrap();
        assert!(init_config(Some(&path), false).is_err());
        init_config(Some(&path), true).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.api.page_size, 120);
        let _ = fs::remove_file(&path);
    }
}
