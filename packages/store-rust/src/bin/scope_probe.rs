//! Binds a tenant and a service context and reports what each transaction
//! observes. Runs against the in-memory engine by default, or a live
//! database with `--database-url` (feature `postgres`).

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use serde_json::json;
use tenantscope_core::ContextDescriptor;
use tenantscope_store::engines::memory::Row;
use tenantscope_store::engines::{MemoryEngine, MemoryManager, RowPolicy};
use tenantscope_store::telemetry::{init_tracing, LogFormat};
use tenantscope_store::{ScopeConfig, ScopeError, TenantScope};

#[derive(Debug, Parser)]
#[command(name = "scope-probe", about = "Check tenant context binding end to end")]
struct Args {
    /// Organization to bind the tenant probe to.
    #[arg(long, default_value = "11111111-1111-1111-1111-111111111111")]
    org_id: String,

    /// User to bind the tenant probe to.
    #[arg(long, default_value = "22222222-2222-2222-2222-222222222222")]
    user_id: String,

    /// Role to bind the tenant probe to.
    #[arg(long, default_value = "MEMBER")]
    role: String,

    /// Probe a live database instead of the in-memory engine.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;
    let config = ScopeConfig::from_env().context("invalid TENANT_SCOPE_* configuration")?;
    let descriptor = ContextDescriptor::tenant(&args.org_id, &args.user_id, &args.role);

    match args.database_url.as_deref() {
        Some(url) => probe_database(url, config, descriptor).await,
        None => probe_memory(config, descriptor).await,
    }
}

fn project(org_id: &str, title: &str) -> Row {
    let mut row = Row::new();
    row.insert("org_id".to_string(), json!(org_id));
    row.insert("title".to_string(), json!(title));
    row
}

async fn probe_memory(config: ScopeConfig, descriptor: ContextDescriptor) -> anyhow::Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    engine.create_table(
        "projects",
        RowPolicy::with_variables("org_id", &config.session_variables),
    );
    if let ContextDescriptor::Tenant(tenant) = &descriptor {
        engine.seed("projects", project(&tenant.org_id, "own project"))?;
    }
    engine.seed(
        "projects",
        project("99999999-9999-9999-9999-999999999999", "another tenant's project"),
    )?;

    let org_variable = config.session_variables.org_id.clone();
    let scope = TenantScope::new(MemoryManager::new(Arc::clone(&engine)), config)?;

    let (bound_org, visible) = scope
        .with_tenant_context(descriptor, |tx| {
            Box::pin(async move {
                let bound = tx.current_setting(&org_variable).map(str::to_string);
                let rows = tx.select("projects").await?;
                Ok::<_, ScopeError>((bound, rows.len()))
            })
        })
        .await?;
    println!(
        "tenant scope: bound org {}, {visible} of {} rows visible",
        bound_org.as_deref().unwrap_or("<unset>"),
        engine.row_count("projects"),
    );

    let all = scope
        .with_service_context("scope-probe", |tx| {
            Box::pin(async move { Ok::<_, ScopeError>(tx.select("projects").await?.len()) })
        })
        .await?;
    println!("service scope: {all} rows visible");

    let status = scope.pool().status();
    println!(
        "pool: size {}, idle {}, in use {}, acquired {}, released {}",
        status.size, status.idle, status.in_use, status.acquired, status.released
    );
    Ok(())
}

#[cfg(feature = "postgres")]
async fn probe_database(
    url: &str,
    config: ScopeConfig,
    descriptor: ContextDescriptor,
) -> anyhow::Result<()> {
    use tenantscope_store::engines::PgManager;
    use tenantscope_store::StorageError;

    let variables = config.session_variables.clone();
    let scope = TenantScope::new(PgManager::from_url(url)?, config)?;

    let names = [
        variables.org_id.clone(),
        variables.user_id.clone(),
        variables.role.clone(),
        variables.bypass.clone(),
    ];
    let observed = scope
        .with_tenant_context(descriptor, move |tx| {
            Box::pin(async move {
                let mut observed = Vec::with_capacity(names.len());
                for name in names {
                    let value: Option<String> =
                        sqlx::query_scalar("SELECT current_setting($1, true)")
                            .bind(&name)
                            .fetch_one(&mut **tx)
                            .await
                            .map_err(StorageError::from)?;
                    observed.push((name, value));
                }
                Ok::<_, ScopeError>(observed)
            })
        })
        .await?;

    for (name, value) in observed {
        println!("{name} = {}", value.as_deref().unwrap_or("<unset>"));
    }
    scope.close();
    Ok(())
}

#[cfg(not(feature = "postgres"))]
async fn probe_database(
    _url: &str,
    _config: ScopeConfig,
    _descriptor: ContextDescriptor,
) -> anyhow::Result<()> {
    anyhow::bail!("scope-probe was built without the `postgres` feature")
}
