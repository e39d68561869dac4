use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tokio::runtime::Runtime;

use crate::app_cache::PersistedAppCache;
use crate::context::{Context, ContextOptions};
use crate::http::HttpClient;
use crate::jobs::binding_repair::BindingRepair;
use crate::jobs::registry::DependencyUpdate;
use crate::jobs::tenant_upgrade::{TenantSelection, TenantUpgrade};
use crate::jobs::{BatchReport, JobPoller};
use crate::platform::AppMetadata;
use crate::roles::Role;
use crate::settings::{self, Environment};

const JOB_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "tenant-operator")]
#[command(about = "Operate multi-tenant SaaS applications", version)]
pub struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true, help = "More log output (repeatable).")]
    verbose: u8,
    #[arg(long, global = true, help = "Print machine-readable JSON.")]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Resolve a role to its deployed app")]
    Resolve(RoleArgs),
    #[command(about = "Show the cached metadata of a role's app")]
    Metadata(RoleArgs),
    #[command(about = "Print an access token for a role's bound service")]
    Token(RoleArgs),
    #[command(subcommand, about = "Tenant operations")]
    Tenants(TenantsCommand),
    #[command(subcommand, about = "Database binding operations")]
    Bindings(BindingsCommand),
    #[command(subcommand, about = "Persisted app metadata cache")]
    Cache(CacheCommand),
    #[command(subcommand, about = "Effective configuration")]
    Config(ConfigCommand),
}

#[derive(Parser)]
struct RoleArgs {
    #[arg(value_enum)]
    role: Role,
}

#[derive(Subcommand)]
enum TenantsCommand {
    #[command(about = "Upgrade tenant databases on the multitenancy runtime")]
    Upgrade(UpgradeArgs),
    #[command(about = "Update subscription dependencies on the tenant registry")]
    UpdateDependencies(TenantListArgs),
}

#[derive(Parser)]
struct UpgradeArgs {
    #[arg(long, conflicts_with = "tenants", help = "Upgrade every tenant.")]
    all: bool,
    tenants: Vec<String>,
}

#[derive(Parser)]
struct TenantListArgs {
    #[arg(required = true)]
    tenants: Vec<String>,
}

#[derive(Subcommand)]
enum BindingsCommand {
    #[command(about = "Create fresh bindings for service instances (default: every unbound one)")]
    Repair(RepairArgs),
}

#[derive(Parser)]
struct RepairArgs {
    instances: Vec<String>,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Delete the persisted app metadata cache")]
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommand {
    #[command(about = "Show configured app names and paths")]
    Show,
}

struct Output {
    json: bool,
}

impl Output {
    fn emit(&self, value: serde_json::Value, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    fn batch(&self, report: &BatchReport) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            println!("{}", report.render_table());
        }
        Ok(report.ensure_success()?)
    }
}

impl Cli {
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }

    pub fn run(self) -> anyhow::Result<()> {
        let session = Session {
            env: Environment::from_process(),
            options: ContextOptions {
                read_only: self.command.read_only(),
            },
        };
        let out = Output { json: self.json };
        match self.command {
            Command::Config(ConfigCommand::Show) => show_config(&session.env, &out),
            Command::Cache(CacheCommand::Clear) => clear_cache(&session.env, &out),
            Command::Resolve(args) => session.block_on(async {
                let app = session.context()?.resolve_app(args.role).await?;
                out.emit(serde_json::to_value(&app)?, || app.name.clone())
            }),
            Command::Metadata(args) => session.block_on(async {
                let metadata = session.context()?.role_metadata(args.role).await?;
                out.emit(serde_json::to_value(&metadata)?, || describe_metadata(&metadata))
            }),
            Command::Token(args) => session.block_on(async {
                let token = session.context()?.role_token(args.role).await?;
                out.emit(json!({ "access_token": token }), || token.clone())
            }),
            Command::Tenants(TenantsCommand::Upgrade(args)) => {
                let selection = match (args.all, args.tenants.is_empty()) {
                    (true, _) => TenantSelection::All,
                    (false, false) => TenantSelection::Only(args.tenants),
                    (false, true) => return Err(anyhow!("name at least one tenant or pass --all")),
                };
                session.block_on(async {
                    let backend =
                        Arc::new(TenantUpgrade::connect(session.context()?, session.client()).await?);
                    let submission = backend.submit(&selection).await?;
                    let report = session.poller()?.wait_all(backend, vec![submission]).await?;
                    out.batch(&report)
                })
            }
            Command::Tenants(TenantsCommand::UpdateDependencies(args)) => session.block_on(async {
                let backend =
                    Arc::new(DependencyUpdate::connect(session.context()?, session.client()).await?);
                let poller = session.poller()?;
                let submissions = poller
                    .submit_all(args.tenants, |tenant| {
                        let backend = Arc::clone(&backend);
                        async move { backend.submit(&tenant).await }
                    })
                    .await?;
                let report = poller.wait_all(backend, submissions).await?;
                out.batch(&report)
            }),
            Command::Bindings(BindingsCommand::Repair(args)) => session.block_on(async {
                let backend =
                    Arc::new(BindingRepair::connect(session.context()?, session.client()).await?);
                let instances = if args.instances.is_empty() {
                    backend.unbound_instances().await?
                } else {
                    args.instances
                };
                if instances.is_empty() {
                    return out.emit(json!({ "jobs": [] }), || {
                        "every service instance has a binding".to_string()
                    });
                }
                let poller = session.poller()?;
                let submissions = poller
                    .submit_all(instances, |instance| {
                        let backend = Arc::clone(&backend);
                        async move { backend.submit(&instance).await }
                    })
                    .await?;
                let report = poller.wait_all(backend, submissions).await?;
                out.batch(&report)
            }),
        }
    }
}

impl Command {
    fn read_only(&self) -> bool {
        matches!(
            self,
            Command::Resolve(_) | Command::Metadata(_) | Command::Token(_) | Command::Config(_)
        )
    }
}

/// What one invocation needs to reach the platform.
struct Session {
    env: Environment,
    options: ContextOptions,
}

impl Session {
    fn block_on<F>(&self, task: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        let runtime = Runtime::new().context("failed to start async runtime")?;
        runtime.block_on(task)
    }

    fn context(&self) -> anyhow::Result<Arc<Context>> {
        Ok(Arc::new(Context::load(self.env.clone(), self.options)?))
    }

    fn client(&self) -> HttpClient {
        HttpClient::new(JOB_REQUEST_TIMEOUT)
    }

    fn poller(&self) -> anyhow::Result<JobPoller> {
        Ok(JobPoller::new(
            Duration::from_secs(self.env.poll_interval_secs()?),
            self.env.concurrency()?,
        ))
    }
}

fn describe_metadata(metadata: &AppMetadata) -> String {
    let mut lines = vec![
        format!("app:     {} ({})", metadata.app.name, metadata.app.guid),
        format!("state:   {}", metadata.app.state),
    ];
    if let Some(url) = metadata.url() {
        lines.push(format!("url:     {url}"));
    }
    if let Some(process) = &metadata.process {
        lines.push(format!("process: {} x{}", process.kind, process.instances));
    }
    lines.join("\n")
}

fn show_config(env: &Environment, out: &Output) -> anyhow::Result<()> {
    let settings_path = settings::settings_path(env)?;
    let stored = settings::load_settings(&settings_path)?;
    let cache_path = settings::cache_file_path(env)?;
    let roles: Vec<serde_json::Value> = Role::all()
        .map(|role| {
            let (app, source) = match (env.get(role.env_var()), stored.app_name(role)) {
                (Some(name), _) => (Some(name), "environment"),
                (None, Some(name)) => (Some(name), "settings"),
                (None, None) => (None, "unset"),
            };
            json!({
                "role": role,
                "app": app,
                "source": source,
                "env_var": role.env_var(),
            })
        })
        .collect();
    let value = json!({
        "settings_file": settings_path.display().to_string(),
        "cache_file": cache_path.display().to_string(),
        "target": stored.target.as_ref().map(|target| &target.api_url),
        "app_suffixes": env.app_suffixes(),
        "roles": roles,
    });
    out.emit(value, || {
        let mut lines = vec![
            format!("settings file: {}", settings_path.display()),
            format!("cache file:    {}", cache_path.display()),
            format!("app suffixes:  {}", env.app_suffixes().join(", ")),
        ];
        for role in Role::all() {
            let app = env
                .get(role.env_var())
                .or_else(|| stored.app_name(role))
                .unwrap_or("-");
            lines.push(format!("{:<28} {app}  ({})", role.to_string(), role.env_var()));
        }
        lines.join("\n")
    })
}

fn clear_cache(env: &Environment, out: &Output) -> anyhow::Result<()> {
    let cache = PersistedAppCache::new(settings::cache_file_path(env)?);
    let removed = cache.clear()?;
    out.emit(
        json!({ "cache_file": cache.path().display().to_string(), "removed": removed }),
        || {
            if removed {
                format!("removed {}", cache.path().display())
            } else {
                format!("no cache at {}", cache.path().display())
            }
        },
    )
}
