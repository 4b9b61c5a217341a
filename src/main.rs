mod billing;
mod cache;
mod clock;
mod config;
mod debounce;
mod error;
mod event;
mod identity;
mod logging;
mod store;
mod sync;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use billing::types::{BillingEntity, BillingPeriod, Dashboard, PendingSiteEntry};
use billing::HttpBillingClient;
use clock::SystemClock;
use event::{EventStream, SyncEvent};
use identity::StaticIdentity;
use store::SqliteStore;
use sync::{ConvergenceOutcome, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "billsync")]
#[command(about = "Keep a billing dashboard's pending sites in step with the billing backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/billsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Account email (overrides api.email from the config)
  #[arg(short, long)]
  email: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show pending sites, purchased domains and license keys
  Status {
    /// Skip the request cache
    #[arg(long)]
    fresh: bool,
  },
  /// Queue sites for purchase
  Add {
    #[arg(required = true)]
    sites: Vec<String>,
    #[arg(short, long, value_enum, default_value_t = Period::Monthly)]
    period: Period,
  },
  /// Drop a pending site by its position in `status` (1-based)
  Remove { position: usize },
  /// Open a checkout session for every pending site
  Checkout,
  /// Process the URL (or query string) the payment processor redirected to
  Return { url: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Period {
  Monthly,
  Yearly,
}

impl From<Period> for BillingPeriod {
  fn from(p: Period) -> Self {
    match p {
      Period::Monthly => BillingPeriod::Monthly,
      Period::Yearly => BillingPeriod::Yearly,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let email = args
    .email
    .or_else(|| config.api.email.clone())
    .ok_or_else(|| eyre!("No account email: pass --email or set api.email in the config"))?;

  let (engine, mut events) = SyncEngine::new(
    &config,
    Arc::new(HttpBillingClient::new(&config)?),
    Arc::new(SqliteStore::open()?),
    Arc::new(SystemClock),
    Arc::new(StaticIdentity::from_email(&email)),
  );

  let result = run(&engine, &mut events, args.command).await;
  engine.settle().await;
  print_events(&mut events);
  result
}

async fn run(engine: &SyncEngine, events: &mut EventStream, command: Command) -> Result<()> {
  match command {
    Command::Status { fresh } => {
      if fresh {
        engine.refresh_fresh().await?;
      } else {
        engine.load_dashboard().await?;
      }
    }
    Command::Add { sites, period } => {
      engine.load_dashboard().await?;
      events.drain();
      for site in &sites {
        engine.add_pending_site(site, period.into())?;
        engine.schedule_refresh();
      }
      // The debounced reload renders the final list once the burst settles
      events.drain();
    }
    Command::Remove { position } => {
      engine.load_dashboard().await?;
      events.drain();
      let index = position
        .checked_sub(1)
        .ok_or_else(|| eyre!("Positions start at 1"))?;
      let removed = engine.remove_pending_site(index)?;
      engine.schedule_refresh();
      events.drain();
      println!("Removed {}", removed.site);
    }
    Command::Checkout => {
      engine.load_dashboard().await?;
      events.drain();
      let session = engine.begin_checkout().await?;
      println!("Complete payment at: {}", session.url);
    }
    Command::Return { url } => match engine.handle_payment_return(&url).await? {
      None => println!("No payment marker found in {}", url),
      Some(ConvergenceOutcome::Converged { pass }) => {
        print_events(events);
        println!("Payment confirmed (check {})", pass);
      }
      Some(ConvergenceOutcome::Unconverged) => {
        print_events(events);
        println!("Payment still processing; run `billsync status` again shortly");
      }
    },
  }
  Ok(())
}

fn print_events(events: &mut EventStream) {
  for event in events.drain() {
    print_event(&event);
  }
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::PendingChanged(pending) => print_pending(pending),
    SyncEvent::Rendered(dashboard) => print_dashboard(dashboard),
    SyncEvent::Processing(sites) => {
      println!("Processing payment for:");
      for entry in sites {
        println!("  {} ({})", entry.site, entry.billing_period);
      }
    }
    SyncEvent::ProcessingCleared => println!("Payment processed"),
    SyncEvent::Error(message) => eprintln!("error: {}", message),
  }
}

fn print_pending(pending: &[PendingSiteEntry]) {
  if pending.is_empty() {
    println!("No pending sites");
    return;
  }
  println!("Pending sites:");
  for (i, entry) in pending.iter().enumerate() {
    println!("  {:>2}. {} ({})", i + 1, entry.site, entry.billing_period);
  }
}

fn print_dashboard(dashboard: &Dashboard) {
  print_pending(&dashboard.pending);
  print_entities("Purchased domains", &dashboard.purchased_domains);
  print_entities("License keys", &dashboard.license_keys);
}

fn print_entities(title: &str, entities: &[BillingEntity]) {
  println!("{}: {}", title, entities.len());
  for entity in entities {
    let period = entity
      .billing_period
      .map(|p| p.to_string())
      .unwrap_or_else(|| "-".to_string());
    let renews = entity
      .period_end
      .map(|d| d.format("%Y-%m-%d").to_string())
      .unwrap_or_else(|| "-".to_string());
    let reference = entity
      .license_key
      .as_deref()
      .or(entity.subscription_id.as_deref())
      .unwrap_or("-");
    println!(
      "  {:<40} {:<11} {:<8} until {:<10} {}",
      entity.identity, entity.status, period, renews, reference
    );
  }
}
