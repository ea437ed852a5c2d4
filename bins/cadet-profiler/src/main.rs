//! CADET Profiler
//!
//! Spins up a set of in-process peers, links them into a line or a ring,
//! opens channels across the overlay and pushes traffic through them.
//! Reports what arrived, how long it took and what the cores counted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use cadet_core::{ChannelEvent, ChannelNumber, ChannelOptions, Network, Port};
use cadet_crypto::PeerIdentity;
use clap::Parser;
use rand::RngCore;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::{ProfilerConfig, Topology};

/// Messages queued before the network is allowed to settle
const SEND_BATCH: usize = 32;

/// CADET overlay profiler
#[derive(Parser)]
#[command(name = "cadet-profiler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "cadet-profiler.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Number of peers (overrides the config file)
    #[arg(short, long)]
    peers: Option<usize>,

    /// Topology (overrides the config file)
    #[arg(short, long, value_enum)]
    topology: Option<Topology>,

    /// Messages per channel (overrides the config file)
    #[arg(short = 'n', long)]
    messages: Option<usize>,

    /// Drop this percentage of neighbor traffic on purpose
    #[arg(long)]
    drop_percent: Option<u8>,

    /// Print the statistics of every peer
    #[arg(long)]
    per_peer: bool,
}

/// Outcome of one run
struct Report {
    peers: Vec<PeerIdentity>,
    channels_opened: usize,
    channels_refused: usize,
    messages_sent: usize,
    messages_failed: usize,
    messages_delivered: usize,
    bytes_delivered: usize,
    transmissions: usize,
    elapsed: Duration,
    totals: BTreeMap<&'static str, i64>,
    per_peer: Vec<(PeerIdentity, Vec<(&'static str, i64)>)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut config = ProfilerConfig::load_or_create(&cli.config)
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(peers) = cli.peers {
        config.profiler.peers = peers;
    }
    if let Some(topology) = cli.topology {
        config.profiler.topology = topology;
    }
    if let Some(messages) = cli.messages {
        config.profiler.messages = messages;
    }
    if let Some(drop_percent) = cli.drop_percent {
        config.core.drop_percent = drop_percent;
    }
    config.validate()?;

    let report = run(&config)?;
    print_report(&config, &report, cli.per_peer);
    Ok(())
}

/// Source and destination of channel `k`
fn endpoints(peers: &[PeerIdentity], topology: Topology, k: usize) -> (PeerIdentity, PeerIdentity) {
    let n = peers.len();
    match topology {
        Topology::Line => {
            // Alternate direction so both ends originate tunnels
            if k % 2 == 0 {
                (peers[0], peers[n - 1])
            } else {
                (peers[n - 1], peers[0])
            }
        }
        Topology::Ring => {
            let from = k % n;
            (peers[from], peers[(from + n / 2) % n])
        }
    }
}

fn run(config: &ProfilerConfig) -> Result<Report> {
    let run = &config.profiler;
    let started = Instant::now();
    let mut net = Network::new();

    let peers = (0..run.peers)
        .map(|_| net.add_peer(config.core.clone()))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to start peers")?;
    for pair in peers.windows(2) {
        net.connect(pair[0], pair[1]);
    }
    if run.topology == Topology::Ring {
        net.connect(peers[run.peers - 1], peers[0]);
    }
    info!("{} peers linked as a {:?}", run.peers, run.topology);

    let port = Port::from_name(&run.port);
    for peer in &peers {
        net.core_mut(peer)
            .context("Peer vanished from the network")?
            .open_port(port)
            .context("Failed to open port")?;
    }

    // Open the channels
    let mut pending = Vec::with_capacity(run.channels);
    for k in 0..run.channels {
        let (from, to) = endpoints(&peers, run.topology, k);
        let chid = net
            .core_mut(&from)
            .context("Peer vanished from the network")?
            .channel_create(to, port, ChannelOptions::RELIABLE)
            .context("Failed to create channel")?;
        debug!("Channel {} from {:?} to {:?}", chid, from, to);
        pending.push((from, to, chid));
    }
    let mut transmissions = net.run_until_idle();

    let mut opened: Vec<(PeerIdentity, PeerIdentity, ChannelNumber)> = Vec::new();
    let mut channels_refused = 0;
    for (at, event) in net.take_events() {
        match event {
            ChannelEvent::ChannelOpened { peer, chid } => {
                if pending.contains(&(at, peer, chid)) {
                    opened.push((at, peer, chid));
                }
            }
            ChannelEvent::ChannelRefused { .. } => channels_refused += 1,
            _ => {}
        }
    }
    if opened.len() < pending.len() {
        warn!("Only {} of {} channels opened", opened.len(), pending.len());
    }

    // Push the traffic
    let mut rng = rand::thread_rng();
    let mut messages_sent = 0;
    let mut messages_failed = 0;
    let mut messages_delivered = 0;
    let mut bytes_delivered = 0;
    for i in 0..run.messages {
        for (from, to, chid) in &opened {
            let mut payload = vec![0u8; run.payload_size];
            rng.fill_bytes(&mut payload);
            let core = net.core_mut(from).context("Peer vanished from the network")?;
            match core.channel_send(*to, *chid, Bytes::from(payload), None) {
                Ok(_) => messages_sent += 1,
                Err(e) => {
                    warn!("Send on {} failed: {}", chid, e);
                    messages_failed += 1;
                }
            }
        }
        if (i + 1) % SEND_BATCH == 0 || i + 1 == run.messages {
            transmissions += net.run_until_idle();
            for (_, event) in net.take_events() {
                if let ChannelEvent::Data { payload, .. } = event {
                    messages_delivered += 1;
                    bytes_delivered += payload.len();
                }
            }
        }
    }

    info!("Traffic done, letting {} virtual seconds pass", run.settle_secs);
    net.advance(Duration::from_secs(run.settle_secs));
    for (_, event) in net.take_events() {
        if let ChannelEvent::Data { payload, .. } = event {
            messages_delivered += 1;
            bytes_delivered += payload.len();
        }
    }
    transmissions = transmissions.max(net.deliveries().len());

    let mut totals = BTreeMap::new();
    let mut per_peer = Vec::with_capacity(peers.len());
    for peer in &peers {
        let core = net.core(peer).context("Peer vanished from the network")?;
        let mut stats: Vec<_> = core.statistics().iter().collect();
        stats.sort();
        for (name, value) in &stats {
            *totals.entry(*name).or_insert(0) += value;
        }
        per_peer.push((*peer, stats));
    }
    net.shutdown();

    Ok(Report {
        peers,
        channels_opened: opened.len(),
        channels_refused,
        messages_sent,
        messages_failed,
        messages_delivered,
        bytes_delivered,
        transmissions,
        elapsed: started.elapsed(),
        totals,
        per_peer,
    })
}

fn print_report(config: &ProfilerConfig, report: &Report, per_peer: bool) {
    let run = &config.profiler;
    println!("CADET profile");
    println!("=============");
    println!("Peers:              {} ({:?})", report.peers.len(), run.topology);
    println!(
        "Channels:           {} opened, {} refused, {} requested",
        report.channels_opened, report.channels_refused, run.channels
    );
    println!(
        "Messages:           {} sent, {} failed, {} delivered",
        report.messages_sent, report.messages_failed, report.messages_delivered
    );
    println!("Payload delivered:  {} bytes", report.bytes_delivered);
    println!("Link transmissions: {}", report.transmissions);
    println!("Wall time:          {:.3?}", report.elapsed);
    if report.messages_sent > 0 {
        let ratio = report.messages_delivered as f64 / report.messages_sent as f64;
        println!("Delivery ratio:     {:.2}%", ratio * 100.0);
    }

    println!();
    println!("Statistics (all peers)");
    for (name, value) in &report.totals {
        println!("  {:<44} {}", name, value);
    }

    if per_peer {
        for (peer, stats) in &report.per_peer {
            println!();
            println!("Peer {}", peer);
            for (name, value) in stats {
                println!("  {:<44} {}", name, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_delivers_everything() {
        let mut config = ProfilerConfig::default();
        config.profiler.peers = 4;
        config.profiler.messages = 40;
        config.profiler.channels = 2;
        config.profiler.payload_size = 64;
        let report = run(&config).unwrap();

        assert_eq!(report.channels_opened, 2);
        assert_eq!(report.messages_sent, 80);
        assert_eq!(report.messages_delivered, 80);
        assert_eq!(report.bytes_delivered, 80 * 64);
        assert_eq!(report.totals.get("# wrong HMAC").copied().unwrap_or(0), 0);
    }

    #[test]
    fn test_ring_endpoints_are_opposite() {
        let peers: Vec<_> = (0..6u8).map(|i| PeerIdentity::from_bytes([i; 32])).collect();
        assert_eq!(endpoints(&peers, Topology::Ring, 1), (peers[1], peers[4]));
        assert_eq!(endpoints(&peers, Topology::Line, 1), (peers[5], peers[0]));
    }
}
