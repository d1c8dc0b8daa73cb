//! # AXON Node IPC Binary
//!
//! Entry point for both sides of the shared-memory pairing plus the cleanup
//! utility.
//!
//! # Usage
//!
//! ```bash
//! # Chain-daemon side
//! axon_node --role server --config /etc/axon/ipc.toml
//!
//! # Analytics side, overriding the namespace
//! axon_node --role client --namespace axon_devnet
//!
//! # Tear down every shared resource of a dead pairing
//! axon_node --role util --namespace axon_devnet --force
//! ```

#![deny(warnings)]

use axon::ProcessRole;
use axon::config::{ConfigLoader, IpcSettings};
use axon_ipc::messages::{
    HandshakeHello, Ping, RankingReply, RankingRequest, RewardReply, RewardRequest, VersionReply,
    VersionRequest,
};
use axon_ipc::{meta, Bookkeeper, Disposition, Service, ServiceConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Protocol revision announced in the handshake.
const PROTOCOL_REVISION: u32 = 1;

/// AXON node IPC runner and cleanup utility
#[derive(Parser, Debug)]
#[command(name = "axon_node")]
#[command(version)]
#[command(about = "Shared-memory IPC runner for the AXON daemon/analytics pairing")]
#[command(long_about = None)]
struct Args {
    /// Role to run as: server (chain daemon side), client (analytics side),
    /// or util (cleanup)
    #[arg(short, long)]
    role: ProcessRole,

    /// Path to the IPC settings file (ipc.toml); defaults apply if omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the namespace from the settings file
    #[arg(short, long)]
    namespace: Option<String>,

    /// Util role only: reset even though live processes are attached
    #[arg(long)]
    force: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("AXON node v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut settings = match &args.config {
        Some(path) => IpcSettings::load(path)?,
        None => IpcSettings::default(),
    };
    if let Some(namespace) = &args.namespace {
        settings.namespace = namespace.clone();
        settings.validate()?;
    }

    match args.role {
        ProcessRole::Util => run_reset(&settings, args.force),
        role => run_service(&settings, role),
    }
}

fn setup_tracing(args: &Args) {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn run_service(
    settings: &IpcSettings,
    role: ProcessRole,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut service = Service::new(ServiceConfig::from_settings(settings, role))?;
    let helper = service.construct_helper();

    match role {
        ProcessRole::Server => register_server_handlers(&mut service)?,
        ProcessRole::Client => register_client_handlers(&mut service, &helper)?,
        ProcessRole::Util => unreachable!("util is dispatched in main"),
    }

    service.run()?;

    let token = service.shutdown_token();
    {
        let token = token.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            token.cancel();
        })?;
    }

    info!(namespace = %settings.namespace, %role, "waiting for peer");
    match service.wait_until_peer_start() {
        Ok(()) => info!("peer attached, session established"),
        Err(e) => {
            error!("pairing never came up: {e}");
            service.shutdown();
            return Err(e.into());
        }
    }

    let hello = helper.construct(HandshakeHello {
        pid: std::process::id(),
        protocol: PROTOCOL_REVISION,
    })?;
    helper.push_back(hello)?;

    if role == ProcessRole::Server {
        // Probe the analytics side once at startup.
        let probe = helper.construct(VersionRequest { height: 0 })?;
        helper.push_back(probe)?;
    }

    while !token.is_cancelled() {
        std::thread::sleep(Duration::from_millis(200));
    }

    if !service.is_peer_alive() {
        warn!("shutting down after peer loss");
    }
    service.shutdown();
    info!("AXON node shutdown complete");
    Ok(())
}

/// Daemon side: consumes replies and acknowledgements from analytics.
fn register_server_handlers(service: &mut Service) -> Result<(), axon_ipc::IpcError> {
    service.add_handler::<HandshakeHello, _>(|hello| {
        info!(
            pid = hello.pid,
            protocol = hello.protocol,
            "analytics process attached"
        );
        Disposition::Dispose
    })?;
    service.add_handler::<Ping, _>(|ping| {
        info!(id = ping.id, "pong from analytics");
        Disposition::Dispose
    })?;
    service.add_handler::<VersionReply, _>(|reply| {
        info!(
            height = reply.height,
            version = format!("{}.{}.{}", reply.major, reply.minor, reply.patch),
            "analytics bundle version"
        );
        Disposition::Dispose
    })?;
    service.add_handler::<RankingReply, _>(|reply| {
        if reply.status != 0 {
            warn!(status = reply.status, "ranking computation failed");
        } else {
            info!(
                start = reply.start_block,
                end = reply.end_block,
                nodes = reply.node_count,
                top_score_milli = reply.top_score_milli,
                "ranking computed"
            );
        }
        Disposition::Dispose
    })?;
    service.add_handler::<RewardReply, _>(|reply| {
        if reply.status != 0 {
            warn!(status = reply.status, "reward computation failed");
        } else {
            info!(
                height = reply.height,
                reward = reply.reward_value,
                "reward computed"
            );
        }
        Disposition::Dispose
    })?;
    Ok(())
}

/// Analytics side: answers daemon requests through a helper clone.
fn register_client_handlers(
    service: &mut Service,
    helper: &axon_ipc::ConstructHelper,
) -> Result<(), axon_ipc::IpcError> {
    service.add_handler::<HandshakeHello, _>(|hello| {
        info!(
            pid = hello.pid,
            protocol = hello.protocol,
            "daemon process attached"
        );
        Disposition::Dispose
    })?;

    {
        let helper = helper.clone();
        service.add_handler::<Ping, _>(move |ping| {
            reply(&helper, Ping { id: ping.id });
            Disposition::Dispose
        })?;
    }
    {
        let helper = helper.clone();
        service.add_handler::<VersionRequest, _>(move |request| {
            reply(
                &helper,
                VersionReply {
                    height: request.height,
                    major: 0,
                    minor: 1,
                    patch: 0,
                    _reserved: 0,
                },
            );
            Disposition::Dispose
        })?;
    }
    {
        let helper = helper.clone();
        service.add_handler::<RankingRequest, _>(move |request| {
            // Real scoring runs in the analytics engine; this binary only
            // wires the transport and answers with an empty result set.
            reply(
                &helper,
                RankingReply {
                    start_block: request.start_block,
                    end_block: request.end_block,
                    top_score_milli: 0,
                    node_count: 0,
                    status: 0,
                },
            );
            Disposition::Dispose
        })?;
    }
    {
        let helper = helper.clone();
        service.add_handler::<RewardRequest, _>(move |request| {
            reply(
                &helper,
                RewardReply {
                    height: request.height,
                    reward_value: 0,
                    status: 0,
                    _reserved: 0,
                },
            );
            Disposition::Dispose
        })?;
    }
    Ok(())
}

fn reply<T: axon_ipc::Payload>(helper: &axon_ipc::ConstructHelper, payload: T) {
    let result = helper
        .construct(payload)
        .and_then(|owned| helper.push_back(owned));
    if let Err(e) = result {
        warn!(type_id = T::TYPE_ID, "failed to publish reply: {e}");
    }
}

/// Util role: sweep every shared resource of a namespace.
fn run_reset(settings: &IpcSettings, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let namespace = &settings.namespace;
    let live = meta::live_attachments(namespace)?;
    if !live.is_empty() && !force {
        for attachment in &live {
            error!(
                pid = attachment.pid,
                role = %attachment.role,
                "namespace is in use"
            );
        }
        return Err(format!(
            "{} live process(es) attached to '{namespace}'; re-run with --force to reset anyway",
            live.len()
        )
        .into());
    }
    if !live.is_empty() {
        warn!(namespace = %namespace, "forcing reset with live attachments");
    }

    // The sweep covers meta files too; they share the namespace prefix.
    let removed = Bookkeeper::new(namespace)?.reset();
    info!(namespace = %namespace, removed, "reset complete");
    Ok(())
}
