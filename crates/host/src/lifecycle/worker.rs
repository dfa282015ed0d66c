//! The per-program worker task: the only writer of a given record's
//! container-facing side effects: no two workers ever mutate the same
//! `ProgramRecord`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::build::ImageBuilder;
use crate::config::Configuration;
use crate::ports::PortAllocator;
use crate::registry::{ProgramId, ProgramRegistry, ProgramState};
use crate::supervisor::ContainerSupervisor;

use super::engine::LifecycleCommand;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const INSPECT_INTERVAL: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct WorkerContext {
    pub program_id: ProgramId,
    pub registry: Arc<ProgramRegistry>,
    pub ports: Arc<PortAllocator>,
    pub builder: Arc<dyn ImageBuilder>,
    pub supervisor: Arc<dyn ContainerSupervisor>,
    pub config: Arc<Configuration>,
    pub http: reqwest::Client,
    pub cancellation: CancellationToken,
}

pub async fn run(ctx: WorkerContext, mut commands: mpsc::Receiver<LifecycleCommand>) {
    if !build_and_create(&ctx).await {
        return; // terminal (BuildFailed or Error) before any container exists
    }

    // Wait for the explicit `/start` command. The registry transition
    // Created -> Starting already happened synchronously in the API
    // handler; this worker performs the actual container start and
    // readiness poll.
    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(LifecycleCommand::Start) => {
                        if !start_and_wait_ready(&ctx).await {
                            return;
                        }
                        break;
                    }
                    Some(LifecycleCommand::Stop) | Some(LifecycleCommand::Shutdown) => {
                        // Aborted before ever reaching Ready: `Stopped` is
                        // only reachable via the Stopping path, which in
                        // turn is only reachable from Ready, so this
                        // settles in Error rather than Stopped.
                        teardown_with_reason(&ctx, "stopped before reaching Ready".to_string()).await;
                        return;
                    }
                    None => return,
                }
            }
            _ = ctx.cancellation.cancelled() => {
                teardown_with_reason(&ctx, "host shutdown before reaching Ready".to_string()).await;
                return;
            }
        }
    }

    run_ready_loop(&ctx, &mut commands).await;
}

/// Runs the build, port acquisition, and container creation. Returns
/// `true` if the program reached `Created` and a worker loop should
/// continue; `false` if it settled into a terminal state already.
async fn build_and_create(ctx: &WorkerContext) -> bool {
    ctx.registry.update(&ctx.program_id, |r| {
        r.transition(ProgramState::Building, None);
    });

    let (user_id, source_files, dockerfile) = match ctx.registry.get(&ctx.program_id) {
        Some(record) => {
            let record = record.read();
            let dockerfile = record
                .source_files
                .get("Dockerfile")
                .cloned()
                .unwrap_or_default();
            (record.user_id.clone(), record.source_files.clone(), dockerfile)
        }
        None => return false,
    };

    let build_result = tokio::time::timeout(
        ctx.config.build_timeout,
        ctx.builder.build(&ctx.program_id, &user_id, &source_files, &dockerfile),
    )
    .await;

    let (image_tag, build_log) = match build_result {
        Ok(Ok(ok)) => ok,
        Ok(Err(err)) => {
            warn!(program_id = %ctx.program_id, error = %err, "build failed");
            ctx.registry.update(&ctx.program_id, |r| {
                r.build_log = err.log();
                r.transition(ProgramState::BuildFailed, Some(err.reason()));
            });
            return false;
        }
        Err(_) => {
            warn!(program_id = %ctx.program_id, "build_timeout exhausted");
            ctx.registry.update(&ctx.program_id, |r| {
                r.transition(ProgramState::BuildFailed, Some("build timed out".to_string()));
            });
            return false;
        }
    };

    let host_port = match ctx.ports.acquire() {
        Ok(port) => port,
        Err(err) => {
            ctx.registry.update(&ctx.program_id, |r| {
                r.transition(ProgramState::Error, Some(format!("port allocation failed: {err}")));
            });
            return false;
        }
    };

    let state_dir = ctx.config.storage_dir.join(&ctx.program_id).join("state");
    if let Err(err) = std::fs::create_dir_all(&state_dir) {
        ctx.ports.release(host_port);
        ctx.registry.update(&ctx.program_id, |r| {
            r.transition(ProgramState::Error, Some(format!("state dir creation failed: {err}")));
        });
        return false;
    }

    let env = std::collections::HashMap::new();
    let create_result = ctx
        .supervisor
        .create(&ctx.program_id, &image_tag, host_port, &env, &state_dir)
        .await;

    match create_result {
        Ok(container_id) => {
            ctx.registry.update(&ctx.program_id, |r| {
                r.image_tag = Some(image_tag.clone());
                r.container_id = Some(container_id.clone());
                r.host_port = Some(host_port);
                r.build_log = build_log.clone();
                r.transition(ProgramState::Created, None);
            });
            info!(program_id = %ctx.program_id, host_port, "program created");
            true
        }
        Err(err) => {
            ctx.ports.release(host_port);
            error!(program_id = %ctx.program_id, error = %err, "container create failed");
            ctx.registry.update(&ctx.program_id, |r| {
                r.transition(ProgramState::Error, Some(format!("container create failed: {err}")));
            });
            false
        }
    }
}

/// Starts the container and polls its Watcher API until it answers or
/// `start_timeout` elapses. Returns `true` if the program reached `Ready`.
async fn start_and_wait_ready(ctx: &WorkerContext) -> bool {
    let (container_id, host_port) = match ctx.registry.get(&ctx.program_id) {
        Some(record) => {
            let record = record.read();
            match (record.container_id.clone(), record.host_port) {
                (Some(c), Some(p)) => (c, p),
                _ => return false,
            }
        }
        None => return false,
    };

    if let Err(err) = ctx.supervisor.start(&container_id).await {
        error!(program_id = %ctx.program_id, error = %err, "container start failed");
        teardown_with_reason(ctx, format!("container start failed: {err}")).await;
        return false;
    }

    let deadline = tokio::time::Instant::now() + ctx.config.start_timeout;
    let status_url = format!("http://127.0.0.1:{host_port}/watcher/status");

    loop {
        if ctx.cancellation.is_cancelled() {
            teardown_with_reason(ctx, "host shutdown before reaching Ready".to_string()).await;
            return false;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(program_id = %ctx.program_id, "start_timeout exhausted");
            teardown_with_reason(ctx, "start timeout".to_string()).await;
            return false;
        }

        match ctx.http.get(&status_url).send().await {
            Ok(resp) if resp.status().is_success() => break,
            _ => {}
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    ctx.registry.update(&ctx.program_id, |r| {
        r.transition(ProgramState::Ready, None);
    });
    info!(program_id = %ctx.program_id, "program ready");
    true
}

async fn run_ready_loop(ctx: &WorkerContext, commands: &mut mpsc::Receiver<LifecycleCommand>) {
    let mut inspect_tick = tokio::time::interval(INSPECT_INTERVAL);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(LifecycleCommand::Stop) | None => {
                        teardown(ctx, ProgramState::Stopping).await;
                        return;
                    }
                    Some(LifecycleCommand::Shutdown) => {
                        teardown(ctx, ProgramState::Stopping).await;
                        return;
                    }
                    Some(LifecycleCommand::Start) => {} // already Ready; no-op
                }
            }
            _ = inspect_tick.tick() => {
                if let Some(record) = ctx.registry.get(&ctx.program_id) {
                    let container_id = record.read().container_id.clone();
                    if let Some(container_id) = container_id {
                        match ctx.supervisor.inspect(&container_id).await {
                            Ok(inspection) if !inspection.running => {
                                warn!(program_id = %ctx.program_id, "container exited unexpectedly");
                                teardown(ctx, ProgramState::Stopping).await;
                                return;
                            }
                            Ok(_) => {}
                            Err(err) => warn!(program_id = %ctx.program_id, error = %err, "inspect failed"),
                        }
                    }
                }
            }
            _ = ctx.cancellation.cancelled() => {
                teardown(ctx, ProgramState::Stopping).await;
                return;
            }
        }
    }
}

async fn teardown(ctx: &WorkerContext, via: ProgramState) {
    ctx.registry.update(&ctx.program_id, |r| {
        r.transition(via, None);
    });
    teardown_with_reason(ctx, String::new()).await;
}

/// Stops and removes the container (if any), releases the port, and
/// settles the record into `Stopped` (or `Error` if `reason` is non-empty).
async fn teardown_with_reason(ctx: &WorkerContext, reason: String) {
    let (container_id, host_port) = match ctx.registry.get(&ctx.program_id) {
        Some(record) => {
            let record = record.read();
            (record.container_id.clone(), record.host_port)
        }
        None => (None, None),
    };

    if let Some(container_id) = &container_id {
        if let Err(err) = ctx.supervisor.stop(container_id, STOP_GRACE).await {
            warn!(program_id = %ctx.program_id, error = %err, "stop failed during teardown");
        }
        if let Err(err) = ctx.supervisor.remove(container_id).await {
            warn!(program_id = %ctx.program_id, error = %err, "remove failed during teardown");
        }
    }

    if let Some(port) = host_port {
        ctx.ports.release(port);
    }

    let final_state = if reason.is_empty() { ProgramState::Stopped } else { ProgramState::Error };
    let error_msg = if reason.is_empty() { None } else { Some(reason) };

    ctx.registry.update(&ctx.program_id, |r| {
        // `Stopping -> Stopped` in the normal path; if we came straight
        // from a fatal error before ever reaching Stopping, `transition`
        // falls back to the `Error`-from-any-non-terminal-state rule.
        if !r.transition(final_state, error_msg.clone()) {
            r.transition(ProgramState::Error, error_msg);
        }
    });
}
