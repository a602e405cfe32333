//! # DeployR Demo Binary
//!
//! Loads a JSON job description, constructs a fabric group, and runs the
//! described deployment with one cooperative task per instance. Every
//! function name the description references is registered with a generic
//! demo entry that logs its launch and exercises the channels its runner
//! participates in: producers push one greeting token per channel, the
//! consumer drains one token per producer.
//!
//! The binary is a development harness; real jobs link the library and
//! register their own entries.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use deployr::{
    channel::ChannelSet,
    cli::Args,
    deployment::ChannelSpec,
    description::JobDescription,
    rpc::RpcContext,
    runtime::DeployRuntime,
    topology::{Device, Topology},
    DeployError,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::DeploymentFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // -v raises the diagnostic level for both the detailed log and the
    // user-facing stream.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed diagnostics go to a file (or stderr); the guard must stay
    // alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("deployr.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "deployr.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing output on stdout unless --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(DeploymentFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    let description =
        JobDescription::from_file(&args.job).context("loading the job description")?;
    let function_names = description.function_names();

    let instances = args
        .instances
        .unwrap_or_else(|| suggested_group_size(&description));
    let coordinator = args.coordinator;
    if coordinator >= instances as u64 {
        return Err(anyhow!(
            "coordinator {coordinator} is outside the group of {instances} instances"
        ));
    }

    info!(
        "deploying {} runners over {} instances (coordinator {})",
        description.runners.len(),
        instances,
        coordinator
    );

    let group = args.fabric.build_group(instances)?;
    let mut tasks = Vec::with_capacity(group.len());
    for fabric in group {
        let deployment = description
            .clone()
            .into_deployment(coordinator)
            .context("building the deployment")?;
        let names = function_names.clone();
        let topology = demo_topology(args.memory_bytes, args.compute);

        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric.clone(), topology);
            runtime.initialize()?;
            for name in &names {
                let entry = demo_entry(
                    name.clone(),
                    runtime.context(),
                    runtime.channels(),
                    deployment.channels().to_vec(),
                );
                runtime.register(name, entry)?;
            }

            let result = runtime.deploy(&deployment).await;
            if let Err(e) = &result {
                error!("instance {instance}: deployment failed: {e}");
                if instance == deployment.coordinator() {
                    // Unblock workers parked in listen; the deployment
                    // cannot proceed without its coordinator.
                    fabric.abort(1).await;
                }
            }
            if let Err(e) = runtime.finalize().await {
                warn!("instance {instance}: finalize failed: {e}");
            }
            result
        }));
    }

    let mut failed = false;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed = true,
            Err(e) => {
                error!("instance task panicked: {e}");
                failed = true;
            }
        }
    }
    if failed {
        return Err(anyhow!("deployment failed"));
    }
    info!("deployment finished");
    Ok(())
}

/// Size the group from the description: room for every directly
/// referenced instance and one instance per runner.
fn suggested_group_size(description: &JobDescription) -> usize {
    let highest_direct = description
        .runners
        .iter()
        .filter_map(|r| r.instance_id)
        .max()
        .map(|id| id as usize + 1)
        .unwrap_or(0);
    highest_direct.max(description.runners.len()).max(1)
}

/// The synthetic topology every demo instance reports.
fn demo_topology(memory_bytes: u64, compute: usize) -> Topology {
    let mut device = Device::new("cpu").with_memory("ram", memory_bytes);
    for _ in 0..compute {
        device = device.with_compute("core");
    }
    Topology::new().with_device(device)
}

/// Build the generic demo entry registered under `name`.
///
/// The entry reads its runner id from the context, then walks the channel
/// specifications: as a producer it pushes one greeting token per channel,
/// as a consumer it drains one token per producer, spinning on `peek`.
fn demo_entry(
    name: String,
    context: Arc<RpcContext>,
    channels: Arc<ChannelSet>,
    specs: Vec<ChannelSpec>,
) -> impl FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    move || {
        let name = name.clone();
        let context = context.clone();
        let channels = channels.clone();
        let specs = specs.clone();
        Box::pin(async move {
            let runner = context.argument();
            info!("runner {runner} entered `{name}`");

            for spec in &specs {
                let Some(channel) = channels.get(&spec.name) else {
                    continue;
                };
                if spec.producers.contains(&runner) {
                    let token = format!("greetings from runner {runner}");
                    loop {
                        match channel.push(token.as_bytes()).await {
                            Ok(()) => break,
                            Err(DeployError::WouldBlock) => tokio::task::yield_now().await,
                            Err(e) => {
                                warn!("runner {runner}: push on `{}` failed: {e}", spec.name);
                                break;
                            }
                        }
                    }
                } else if spec.consumer == runner {
                    let mut drained = 0;
                    while drained < spec.producers.len() {
                        // Copy the peeked token out before yielding; the
                        // borrowed view must not outlive this poll.
                        let text = match channel.peek() {
                            Ok(token) => Some(String::from_utf8_lossy(&token).into_owned()),
                            Err(DeployError::Empty) => None,
                            Err(e) => {
                                warn!("runner {runner}: peek on `{}` failed: {e}", spec.name);
                                break;
                            }
                        };
                        match text {
                            Some(text) => {
                                info!("channel `{}` delivered: {text}", spec.name);
                                if let Err(e) = channel.pop() {
                                    warn!("runner {runner}: pop on `{}` failed: {e}", spec.name);
                                    break;
                                }
                                drained += 1;
                            }
                            None => tokio::task::yield_now().await,
                        }
                    }
                }
            }
            info!("runner {runner} leaving `{name}`");
        })
    }
}
