//! relayd entry point
//!
//! Attaches every configured adapter over a looped-back transport, runs
//! until interrupted, then halts them and prints their counters as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use relay_adapter::{
    Adapter, AdapterRegistry, BringUp, DriverContext, LoopbackConfig, LoopbackProvider,
    MacAddress, NotificationHub, PacketFilter, ProtocolBinding, ReceivedFrame, SendStatus,
    SendToken, StatusIndication, SubmitOutcome,
};
use relay_config::{defaults::ethernet, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Local experimental EtherType used for probe frames
const PROBE_ETHERTYPE: [u8; 2] = [0x88, 0xb5];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "relayd=info,relay_adapter=info,warn")]
    log_filter: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Start with the transport unavailable and announce it after this delay
    #[arg(long)]
    transport_delay_ms: Option<u64>,

    /// Broadcast probe frames each adapter sends once it is up
    #[arg(long, default_value_t = 0)]
    probe_frames: u8,
}

/// Protocol binding that logs everything the adapters indicate upward
struct LoggingBinding;

impl ProtocolBinding for LoggingBinding {
    fn send_complete(&self, token: SendToken, status: SendStatus) {
        match status {
            SendStatus::Success => debug!(token, "Send complete"),
            other => warn!(token, status = ?other, "Send did not complete"),
        }
    }

    fn indicate_receive(&self, frame: ReceivedFrame) {
        info!(adapter = %frame.adapter(), len = frame.len(), "Frame received");
    }

    fn indicate_status(&self, indication: StatusIndication) {
        info!(?indication, "Status indication");
    }
}

fn init_logging(filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn probe_frame(source: MacAddress, sequence: u8) -> Vec<u8> {
    let mut frame = vec![0u8; ethernet::MIN_PACKET_SIZE];
    frame[..6].copy_from_slice(&MacAddress::BROADCAST.octets());
    frame[6..12].copy_from_slice(&source.octets());
    frame[12..14].copy_from_slice(&PROBE_ETHERTYPE);
    frame[ethernet::HEADER_SIZE] = sequence;
    frame
}

fn send_probes(adapter: &Adapter, count: u8) {
    for sequence in 0..count {
        match adapter.submit_frame(probe_frame(adapter.current_address(), sequence)) {
            SubmitOutcome::Accepted { token, pending } => {
                debug!(adapter = %adapter.name(), token, pending, "Probe queued")
            }
            SubmitOutcome::Rejected(reason) => {
                warn!(adapter = %adapter.name(), ?reason, "Probe rejected")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_filter, args.json_logs);

    info!("Starting relayd {}", env!("CARGO_PKG_VERSION"));
    let config = load_config(args.config.as_deref())?;

    let hub = Arc::new(NotificationHub::new());
    let provider = Arc::new(LoopbackProvider::new(
        LoopbackConfig::looped(),
        args.transport_delay_ms.is_none(),
    ));
    provider.announce_on(Arc::clone(&hub), config.notification_channel.clone());

    let context = DriverContext::new(provider.clone(), hub, config.notification_channel.clone());
    let registry = AdapterRegistry::new(context);
    let binding: Arc<dyn ProtocolBinding> = Arc::new(LoggingBinding);

    let mut adapters = Vec::new();
    for settings in config.adapters {
        let name = settings.name.clone();
        match registry.attach(settings, Arc::clone(&binding)).await {
            Ok((adapter, bring_up)) => {
                info!(adapter = %name, ?bring_up, address = %adapter.current_address(), "Adapter attached");
                if let Err(e) = adapter.set_packet_filter(
                    (PacketFilter::DIRECTED | PacketFilter::BROADCAST).bits(),
                ) {
                    warn!(adapter = %name, error = %e, "Could not set packet filter");
                }
                if bring_up == BringUp::Complete {
                    send_probes(&adapter, args.probe_frames);
                }
                adapters.push(adapter);
            }
            Err(e) => error!(adapter = %name, error = %e, "Failed to attach adapter"),
        }
    }
    if adapters.is_empty() {
        bail!("no adapter could be attached");
    }

    if let Some(delay) = args.transport_delay_ms {
        let provider = Arc::clone(&provider);
        let pending: Vec<Adapter> = adapters.clone();
        let probes = args.probe_frames;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            info!("Transport available");
            provider.set_ready();
            // Probes queue until each adapter finishes bring-up
            for adapter in &pending {
                send_probes(adapter, probes);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    registry.halt_all().await;

    for adapter in &adapters {
        let report = serde_json::json!({
            "adapter": adapter.name(),
            "removal_requested": adapter.removal_requested(),
            "counters": adapter.query_counters(),
        });
        println!("{}", serde_json::to_string(&report)?);
    }

    info!("relayd stopped");
    Ok(())
}
