use anyhow::{Result, bail};
use clap::Parser;
use dvbulk::application::{RoundTripOptions, RoundTripSummary, round_trip};
use dvbulk::auth::DEFAULT_AUTHORITY_HOST;
use dvbulk::bulk::{BatchReport, Outcome};
use dvbulk::config::{DEFAULT_API_VERSION, Settings};
use dvbulk::http::DEFAULT_MAX_RETRIES;
use log::warn;
use tokio_util::sync::CancellationToken;

/// dvbulk - bulk create/delete against the Dataverse Web API
///
/// Authenticates as an application user with the OAuth2 client-credentials
/// grant. Throttled (429) and failing (5xx) requests are retried with backoff.
///
/// Examples:
///   dvbulk whoami
///   dvbulk roundtrip --count 100 --concurrency 8
#[derive(Parser, Debug)]
#[command(author, version = env!("DVBULK_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Environment URL, e.g. https://org.crm.dynamics.com
    #[arg(long, env = "DATAVERSE_URL", value_name = "URL", global = true)]
    url: Option<String>,

    /// Microsoft Entra tenant id
    #[arg(long, env = "DATAVERSE_TENANT_ID", global = true)]
    tenant_id: Option<String>,

    /// Application (client) id
    #[arg(long, env = "DATAVERSE_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// Client secret
    #[arg(long, env = "DATAVERSE_CLIENT_SECRET", hide_env_values = true, global = true)]
    client_secret: Option<String>,

    /// Token authority
    #[arg(
        long,
        env = "DATAVERSE_AUTHORITY_HOST",
        value_name = "URL",
        default_value = DEFAULT_AUTHORITY_HOST,
        global = true
    )]
    authority_host: String,

    /// Web API version
    #[arg(long, default_value = DEFAULT_API_VERSION, global = true)]
    api_version: String,

    /// Retries for throttled or failing requests
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, global = true)]
    max_retries: u32,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show the identity the client credentials resolve to
    Whoami,

    /// Create records in a collection, then delete them again
    Roundtrip(RoundtripArgs),
}

#[derive(clap::Args, Debug)]
struct RoundtripArgs {
    /// Number of records to create
    #[arg(long, short = 'n', default_value_t = 10)]
    count: usize,

    /// Maximum requests in flight [default: the service's recommendation, else 4]
    #[arg(long, short = 'c')]
    concurrency: Option<usize>,

    /// Entity set name
    #[arg(long, default_value = "accounts")]
    collection: String,

    /// Attribute that receives the generated value
    #[arg(long, default_value = "name")]
    field: String,

    /// Prefix for generated values
    #[arg(long, default_value = "Record")]
    prefix: String,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let (Some(url), Some(tenant_id), Some(client_id), Some(client_secret)) = (
            &self.url,
            &self.tenant_id,
            &self.client_id,
            &self.client_secret,
        ) else {
            bail!(
                "--url, --tenant-id, --client-id and --client-secret are required \
                 (or DATAVERSE_URL, DATAVERSE_TENANT_ID, DATAVERSE_CLIENT_ID, DATAVERSE_CLIENT_SECRET)"
            );
        };

        let mut settings = Settings::new(url, tenant_id, client_id, client_secret);
        settings.authority_host = self.authority_host.clone();
        settings.api_version = self.api_version.clone();
        settings.max_retries = self.max_retries;
        Ok(settings)
    }
}

impl From<RoundtripArgs> for RoundTripOptions {
    fn from(args: RoundtripArgs) -> Self {
        Self {
            collection: args.collection,
            count: args.count,
            max_concurrency: args.concurrency,
            field: args.field,
            prefix: args.prefix,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let connection = cli.settings()?.connect()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight requests");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Whoami => {
            let who = connection.web_api.who_am_i(&cancel).await?;
            println!("User:          {}", who.user_id);
            println!("Business unit: {}", who.business_unit_id);
            println!("Organization:  {}", who.organization_id);
        }
        Commands::Roundtrip(args) => {
            let options = RoundTripOptions::from(args);
            let summary =
                round_trip(&connection.executor, &connection.web_api, &options, cancel).await?;
            print_summary(&options, &summary);
            if summary.failure_count() > 0 {
                bail!("{} operations failed", summary.failure_count());
            }
        }
    }
    Ok(())
}

fn print_summary(options: &RoundTripOptions, summary: &RoundTripSummary) {
    println!("Concurrency: {}", summary.concurrency);
    print_phase("Created", options.count, &summary.created);
    print_phase("Deleted", summary.created.created_ids().len(), &summary.deleted);
    if summary.orphaned > 0 {
        println!("Orphaned: {} (no entity id returned)", summary.orphaned);
    }
    println!("Total:    {:?}", summary.elapsed());
}

fn print_phase(label: &str, requested: usize, report: &BatchReport) {
    println!(
        "{}:  {}/{} in {:?}",
        label, report.success_count, requested, report.elapsed
    );
    for failure in &report.failures {
        if let Outcome::Failure { kind, message } = &failure.outcome {
            println!(
                "  {} failed ({}, {} attempts): {}",
                failure.operation, kind, failure.attempts, message
            );
        }
    }
}
