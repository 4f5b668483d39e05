//! Botdesk quota diagnostic tool
//!
//! Resolves a company's token quota against the live database and prints the
//! report as JSON, including any invariant divergence found on the way.
//!
//! ## Usage
//! ```bash
//! # Lifetime-to-date usage
//! botdesk-quota <company-id>
//!
//! # Current subscription period, failing on any aggregate mismatch
//! botdesk-quota <company-id> --current-period --mode strict
//!
//! # Explicit window
//! botdesk-quota <company-id> --window-start 2025-10-01T00:00:00Z --window-end 2025-11-01T00:00:00Z
//!
//! # Would a 5000 token request be admitted?
//! botdesk-quota <company-id> --admit 5000
//!
//! # Plan catalog
//! botdesk-quota --plans [--active]
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - DATABASE_MAX_CONNECTIONS: pool size (default 3)
//! - QUOTA_RECONCILE_MODE: server | verify | strict (default verify)
//! - QUOTA_RESOLVE_TIMEOUT_MS: resolution deadline (default 10000)
//! - RUST_LOG: log filter (default info)
//! - LOG_FORMAT: json | pretty (default pretty)
//!
//! Exit status is 0 for a clean report, 2 when diagnostics were raised and 1
//! when an admission check denies the request.

use anyhow::{anyhow, bail, Context};
use botdesk_billing::{PgQuotaStore, QuotaConfig, QuotaResolution, QuotaService, QuotaWindow, ReconcileMode};
use botdesk_shared::{BillingWindow, CompanyId};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: botdesk-quota <company-id> [--current-period] [--window-start RFC3339] \
[--window-end RFC3339] [--mode server|verify|strict] [--admit TOKENS] [--migrate]\n       \
botdesk-quota --plans [--active] [--migrate]";

#[derive(Debug, Default)]
struct Args {
    company_id: Option<CompanyId>,
    window_start: Option<OffsetDateTime>,
    window_end: Option<OffsetDateTime>,
    current_period: bool,
    mode: Option<ReconcileMode>,
    admit: Option<u64>,
    plans: bool,
    active_only: bool,
    migrate: bool,
}

impl Args {
    fn parse<I: Iterator<Item = String>>(mut raw: I) -> anyhow::Result<Self> {
        let mut args = Args::default();

        while let Some(arg) = raw.next() {
            let mut value = |flag: &str| {
                raw.next()
                    .ok_or_else(|| anyhow!("{} requires a value", flag))
            };
            match arg.as_str() {
                "--current-period" => args.current_period = true,
                "--window-start" => args.window_start = Some(parse_time(&value("--window-start")?)?),
                "--window-end" => args.window_end = Some(parse_time(&value("--window-end")?)?),
                "--mode" => args.mode = Some(value("--mode")?.parse()?),
                "--admit" => {
                    let tokens = value("--admit")?;
                    args.admit = Some(
                        tokens
                            .parse()
                            .with_context(|| format!("invalid token count: {}", tokens))?,
                    );
                }
                "--plans" => args.plans = true,
                "--active" => args.active_only = true,
                "--migrate" => args.migrate = true,
                "-h" | "--help" => bail!("{}", USAGE),
                flag if flag.starts_with("--") => bail!("unknown flag {}\n{}", flag, USAGE),
                id => {
                    if args.company_id.is_some() {
                        bail!("unexpected argument {}\n{}", id, USAGE);
                    }
                    args.company_id = Some(
                        id.parse()
                            .with_context(|| format!("invalid company id: {}", id))?,
                    );
                }
            }
        }

        if !args.plans && args.company_id.is_none() {
            bail!("{}", USAGE);
        }
        if args.current_period && (args.window_start.is_some() || args.window_end.is_some()) {
            bail!("--current-period cannot be combined with --window-start/--window-end");
        }
        Ok(args)
    }

    fn window(&self) -> anyhow::Result<QuotaWindow> {
        if self.current_period {
            return Ok(QuotaWindow::CurrentPeriod);
        }
        Ok(QuotaWindow::Explicit(BillingWindow::new(
            self.window_start,
            self.window_end,
        )?))
    }
}

fn parse_time(raw: &str) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).with_context(|| format!("invalid RFC3339 timestamp: {}", raw))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    // Logs go to stderr so stdout stays parseable JSON
    if env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false) {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .flatten_event(true),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse(env::args().skip(1))?;

    let mut config = QuotaConfig::from_env()?;
    if let Some(mode) = args.mode {
        config.reconcile_mode = mode;
    }

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid DATABASE_MAX_CONNECTIONS: {}", raw))?,
        Err(_) => botdesk_shared::DEFAULT_MAX_CONNECTIONS,
    };

    let pool = botdesk_shared::create_pool(&database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    if args.migrate {
        botdesk_shared::run_migrations(&pool).await?;
        tracing::info!("Migrations applied");
    }

    let service = QuotaService::new(Arc::new(PgQuotaStore::new(pool)), config);

    if args.plans {
        let plans = if args.active_only {
            service.catalog().list_active_plans().await?
        } else {
            service.catalog().list_plans().await?
        };
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(ExitCode::SUCCESS);
    }

    let company_id = args
        .company_id
        .ok_or_else(|| anyhow!("company id is required"))?;

    let cancel = CancellationToken::new();
    let deadline = service.config().resolve_timeout;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    tracing::warn!(timeout_ms = deadline.as_millis() as u64, "Resolution deadline reached");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted");
                }
            }
            cancel.cancel();
        });
    }

    if let Some(requested) = args.admit {
        let admission = service
            .check_admission(company_id, requested, &cancel)
            .await?;
        println!("{}", serde_json::to_string_pretty(&admission)?);
        return Ok(if !admission.is_allowed() {
            ExitCode::from(1)
        } else if !admission.is_clean() {
            ExitCode::from(2)
        } else {
            ExitCode::SUCCESS
        });
    }

    let resolution = service
        .resolve_at(company_id, args.window()?, OffsetDateTime::now_utc(), &cancel)
        .await?;
    println!("{}", serde_json::to_string_pretty(&resolution)?);

    match &resolution {
        QuotaResolution::Resolved(report) if !report.is_clean() => Ok(ExitCode::from(2)),
        _ => Ok(ExitCode::SUCCESS),
    }
}
