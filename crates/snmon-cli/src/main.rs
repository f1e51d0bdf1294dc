use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use snmon_core::{
    AlertEvaluator, AlertKind, AlertTarget, CacheInvalidator, ConfigProvider, Discovery, NoopCache,
    Notifier, Operator, PollCoordinator, PollKind, PollSummary, Poller, Settings, SettingsOverride,
    Snmp2Client, SqliteStore, StoreConfig, StoreError, ThresholdUpdate, DEFAULT_LEASE_TTL,
};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod exporter;
mod mailer;
#[cfg(test)]
mod mailer_tests;

use exporter::CycleExporter;
use mailer::{MailSettings, SmtpSink};

#[derive(Debug, Parser)]
#[command(name = "snmond")]
#[command(about = "SNMP network monitor: discovery, polling and alerting")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "./data/snmon.db")]
    database: PathBuf,

    #[arg(long, default_value = "public")]
    community: String,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    retries: u32,

    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    #[arg(long, default_value_t = 20)]
    discovery_concurrency: usize,

    #[arg(long, default_value_t = 20)]
    polling_concurrency: usize,

    #[arg(long)]
    smtp_host: Option<String>,

    #[arg(long, default_value_t = 587)]
    smtp_port: u16,

    #[arg(long)]
    smtp_user: Option<String>,

    #[arg(long)]
    smtp_password: Option<String>,

    #[arg(long)]
    smtp_from: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a block, or the configured discovery network when omitted.
    Discover {
        #[arg(long)]
        network: Option<Ipv4Addr>,
        #[arg(long)]
        prefix: Option<u8>,
    },
    /// Run one poll cycle now.
    Poll {
        #[arg(long)]
        export_dir: Option<String>,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
    /// Poll every interval until interrupted.
    Run {
        #[arg(long)]
        export_dir: Option<String>,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
    Devices,
    Interfaces {
        address: Ipv4Addr,
    },
    History {
        address: Option<Ipv4Addr>,
    },
    Ack(AlertArgs),
    Resolve(AlertArgs),
    Thresholds {
        address: Ipv4Addr,
        #[arg(long)]
        cpu: Option<f64>,
        #[arg(long)]
        memory: Option<f64>,
        #[arg(long)]
        failures: Option<u32>,
    },
    InterfaceThreshold {
        address: Ipv4Addr,
        if_index: u32,
        /// Discard rate in percent.
        percent: f64,
    },
    Maintenance {
        address: Ipv4Addr,
        #[arg(long)]
        off: bool,
        #[arg(long, default_value_t = snmon_core::commands::DEFAULT_MAINTENANCE_MINUTES)]
        minutes: u32,
        #[arg(long)]
        reason: Option<String>,
    },
    RemoveDevice {
        address: Ipv4Addr,
    },
    Recipients {
        #[command(subcommand)]
        action: RecipientAction,
    },
    /// Persist settings overrides and print the effective settings.
    Settings {
        #[arg(long)]
        community: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        retries: Option<u32>,
        #[arg(long)]
        interval_secs: Option<u64>,
        #[arg(long)]
        discovery_concurrency: Option<usize>,
        #[arg(long)]
        polling_concurrency: Option<usize>,
        #[arg(long)]
        network: Option<Ipv4Addr>,
        #[arg(long)]
        prefix: Option<u8>,
    },
}

#[derive(Debug, clap::Args)]
struct AlertArgs {
    address: Ipv4Addr,
    #[arg(value_enum)]
    metric: Metric,
    /// Targets an interface alert when set.
    #[arg(long)]
    if_index: Option<u32>,
    #[arg(long, default_value = "operator")]
    actor: String,
    #[arg(long)]
    notes: Option<String>,
}

impl AlertArgs {
    fn target(&self) -> AlertTarget {
        let kind = self.metric.kind();
        match self.if_index {
            Some(if_index) => AlertTarget::Interface {
                address: self.address,
                if_index,
                kind,
            },
            None => AlertTarget::Device {
                address: self.address,
                kind,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Metric {
    Cpu,
    Memory,
    Reachability,
    InterfaceStatus,
    PacketDrop,
}

impl Metric {
    fn kind(self) -> AlertKind {
        match self {
            Metric::Cpu => AlertKind::Cpu,
            Metric::Memory => AlertKind::Memory,
            Metric::Reachability => AlertKind::Reachability,
            Metric::InterfaceStatus => AlertKind::InterfaceStatus,
            Metric::PacketDrop => AlertKind::PacketDrop,
        }
    }
}

#[derive(Debug, Subcommand)]
enum RecipientAction {
    Add { email: String },
    Remove { email: String },
    List,
}

struct App {
    config: Arc<StoreConfig<SqliteStore>>,
    notifier: Arc<Notifier<SqliteStore>>,
    coordinator: PollCoordinator,
    poller: Poller<SqliteStore>,
    discovery: Discovery<SqliteStore>,
    operator: Operator<SqliteStore>,
}

impl App {
    fn build(cli: &Cli) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&cli.database)
                .with_context(|| format!("opening database {}", cli.database.display()))?,
        );
        let coordinator = PollCoordinator::with_lease(Arc::new(store.poll_lease(DEFAULT_LEASE_TTL)));
        let defaults = Settings {
            snmp_community: cli.community.clone(),
            snmp_timeout_secs: cli.timeout_secs,
            snmp_retries: cli.retries,
            polling_interval_secs: cli.interval_secs,
            discovery_concurrency: cli.discovery_concurrency,
            polling_concurrency: cli.polling_concurrency,
            ..Settings::default()
        };
        let config = Arc::new(StoreConfig::new(defaults, store.clone()));

        let sink = SmtpSink::new(&MailSettings {
            host: cli.smtp_host.clone(),
            port: cli.smtp_port,
            username: cli.smtp_user.clone(),
            password: cli.smtp_password.clone(),
            from: cli.smtp_from.clone(),
        })?;
        let notifier = Arc::new(Notifier::new(Arc::new(sink), store.clone()));
        let cache: Arc<dyn CacheInvalidator> = Arc::new(NoopCache);
        let evaluator = AlertEvaluator::new(notifier.clone()).with_cache(cache.clone());
        let snmp = Arc::new(Snmp2Client::default());

        Ok(Self {
            poller: Poller::new(snmp.clone(), store.clone(), config.clone(), evaluator),
            discovery: Discovery::new(snmp, store.clone(), config.clone()),
            operator: Operator::new(store, cache),
            coordinator,
            config,
            notifier,
        })
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let app = App::build(&cli)?;

    match cli.command {
        Command::Discover { network, prefix } => {
            let summary = match (network, prefix) {
                (Some(network), Some(prefix)) => app.discovery.scan(network, prefix).await?,
                (None, None) => app.discovery.scan_configured().await?,
                _ => anyhow::bail!("--network and --prefix must be given together"),
            };
            app.notifier.flush().await;
            print_json(&summary)?;
        }
        Command::Poll {
            export_dir,
            retention_days,
        } => {
            let summary = app.coordinator.manual(app.poller.run_cycle()).await??;
            if let Some(dir) = export_dir {
                CycleExporter::new(dir, retention_days)?.write_cycle(&summary, PollKind::Manual)?;
            }
            app.notifier.flush().await;
            print_json(&summary)?;
        }
        Command::Run {
            export_dir,
            retention_days,
        } => {
            let exporter = export_dir
                .map(|dir| CycleExporter::new(dir, retention_days))
                .transpose()?;
            run_loop(&app, exporter).await?;
        }
        Command::Devices => print_json(&app.operator.devices()?)?,
        Command::Interfaces { address } => print_json(&app.operator.interfaces(address)?)?,
        Command::History { address } => print_json(&app.operator.alert_history(address)?)?,
        Command::Ack(args) => {
            let slot = app
                .operator
                .acknowledge(args.target(), &args.actor, args.notes.as_deref())
                .await?;
            app.notifier.flush().await;
            print_json(&slot)?;
        }
        Command::Resolve(args) => {
            let slot = app
                .operator
                .resolve(args.target(), &args.actor, args.notes.as_deref())
                .await?;
            app.notifier.flush().await;
            print_json(&slot)?;
        }
        Command::Thresholds {
            address,
            cpu,
            memory,
            failures,
        } => {
            let device = app
                .operator
                .update_thresholds(address, ThresholdUpdate { cpu, memory, failures })
                .await?;
            app.notifier.flush().await;
            print_json(&device.thresholds)?;
        }
        Command::InterfaceThreshold {
            address,
            if_index,
            percent,
        } => {
            let interface = app
                .operator
                .update_interface_threshold(address, if_index, percent)
                .await?;
            app.notifier.flush().await;
            print_json(&interface)?;
        }
        Command::Maintenance {
            address,
            off,
            minutes,
            reason,
        } => {
            let device = app
                .operator
                .set_maintenance(address, !off, minutes, reason.as_deref())
                .await?;
            app.notifier.flush().await;
            print_json(&device.maintenance)?;
        }
        Command::RemoveDevice { address } => {
            app.operator.remove_device(address).await?;
            app.notifier.flush().await;
        }
        Command::Recipients { action } => match action {
            RecipientAction::Add { email } => {
                let added = app.operator.add_recipient(&email).await?;
                app.notifier.flush().await;
                print_json(&serde_json::json!({ "email": email, "added": added }))?;
            }
            RecipientAction::Remove { email } => {
                let removed = app.operator.remove_recipient(&email).await?;
                app.notifier.flush().await;
                print_json(&serde_json::json!({ "email": email, "removed": removed }))?;
            }
            RecipientAction::List => print_json(&app.operator.recipients()?)?,
        },
        Command::Settings {
            community,
            timeout_secs,
            retries,
            interval_secs,
            discovery_concurrency,
            polling_concurrency,
            network,
            prefix,
        } => {
            let layer = SettingsOverride {
                snmp_community: community,
                snmp_timeout_secs: timeout_secs,
                snmp_retries: retries,
                polling_interval_secs: interval_secs,
                discovery_concurrency,
                polling_concurrency,
                discovery_network: network,
                discovery_prefix: prefix,
            };
            if layer != SettingsOverride::default() {
                app.operator.update_settings(layer).await?;
                app.notifier.flush().await;
            }
            print_json(&app.config.snapshot())?;
        }
    }

    Ok(())
}

/// Fires an automatic cycle on every tick. Cycles run in the background;
/// a tick that lands while one is still running is skipped by the
/// coordinator. The interval is re-read after every tick.
async fn run_loop(app: &App, mut exporter: Option<CycleExporter>) -> Result<()> {
    let coordinator = app.coordinator.clone();
    let (done_tx, mut done_rx) = mpsc::channel::<Result<PollSummary, StoreError>>(4);

    let start = Instant::now() + Duration::from_millis(50);
    let mut ticker = interval_at(start, app.config.snapshot().polling_interval());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = ticker.tick() => {
                let coordinator = coordinator.clone();
                let poller = app.poller.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    if let Some(result) = coordinator.automatic(poller.run_cycle()).await {
                        let _ = done.send(result).await;
                    }
                });

                let next = app.config.snapshot().polling_interval();
                ticker = interval_at(Instant::now() + next, next);
                info!(next_poll_secs = next.as_secs(), "tick");
            }
            Some(result) = done_rx.recv() => {
                match result {
                    Ok(summary) => {
                        if let Some(exporter) = exporter.as_mut() {
                            if let Err(err) = exporter.write_cycle(&summary, PollKind::Automatic) {
                                warn!(error = %err, "failed to export poll cycle");
                            }
                        }
                    }
                    Err(err) => error!(error = %err, "poll cycle failed"),
                }
                app.notifier.flush().await;
            }
        }
    }

    if coordinator.status().await.running {
        warn!("shutting down with a poll cycle in flight");
    }
    app.notifier.flush().await;
    Ok(())
}
