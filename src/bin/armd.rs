//! armd - on-demand service activation daemon
//!
//! Starts the default services, binds the addresses of every lazily started
//! service and launches each one on its first connection.
//!
//! Listens on /run/armd.sock (or $XDG_RUNTIME_DIR/armd.sock for non-root
//! users) for commands from armctl.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use log::info;
use tokio::sync::{mpsc, oneshot};

use armd::activation::ActivationManager;
use armd::config::ArmConfig;
use armd::launcher::{ProcessLauncher, ServiceStatus};
use armd::protocol::{default_socket_path, Request, Response};
use armd::registry::Registry;
use armd::signals::{ArmSignal, SignalHandler};
use peercred_ipc::{CallerInfo, Connection, Server};

/// How often exited services are collected and restarted
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL at shutdown
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "armd")]
#[command(about = "On-demand service activation daemon")]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/armd/armd.conf)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Control socket path (overrides [arm] UNIXPATH)
    #[arg(long)]
    socket: Option<String>,
}

/// A control request waiting for the event loop to answer it
struct ControlRequest {
    request: Request,
    reply: oneshot::Sender<Response>,
}

type Manager = ActivationManager<ProcessLauncher>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = args
        .config
        .or_else(|| dirs::config_dir().map(|d| d.join("armd").join("armd.conf")))
        .ok_or("no configuration file given and no config directory known")?;
    let config = ArmConfig::load(&config_path).await.map_err(|e| {
        log::error!("Failed to load {}: {}", config_path.display(), e);
        e
    })?;
    info!(
        "Loaded {} service section(s) from {}",
        config.services.len(),
        config_path.display()
    );

    let registry = Registry::new(&config);
    let mut manager = ActivationManager::new(
        ProcessLauncher::new(config.clone()),
        registry.defaults().clone(),
        config.probe_timeout,
    );

    let started = manager.start_default_services();
    info!("Started {} of {} default service(s)", started, registry.defaults().len());

    let monitored = registry.configure(&mut manager);
    info!("Monitoring {} address(es) for lazily started services", monitored);

    let sock_path = args
        .socket
        .or_else(|| config.control_path.as_ref().map(|p| p.display().to_string()))
        .unwrap_or_else(default_socket_path);
    let _ = std::fs::remove_file(&sock_path);
    let server = Server::bind(&sock_path)?;
    info!("armd listening on {}", sock_path);

    let (ipc_tx, mut ipc_rx) = mpsc::channel::<ControlRequest>(32);
    tokio::spawn(accept_loop(server, ipc_tx));

    let mut signal_rx = SignalHandler::new()?.spawn_forwarder();
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        tokio::select! {
            event = manager.next_event() => {
                if let Err(e) = manager.handle_event(event) {
                    log::error!("{}", e);
                }
            }
            Some(ControlRequest { request, reply }) = ipc_rx.recv() => {
                let response = handle_request(request, &mut manager);
                let _ = reply.send(response);
            }
            Some(sig) = signal_rx.recv() => {
                if SignalHandler::is_shutdown(sig) {
                    info!("Received {:?}, shutting down", sig);
                    break;
                }
                dump_state(&manager);
            }
            _ = maintenance.tick() => {
                let now = Instant::now();
                let launcher = manager.launcher_mut();
                launcher.reap(now);
                launcher.restart_due(now);
            }
        }
    }

    manager.shutdown();
    manager.launcher_mut().terminate_all(STOP_TIMEOUT).await;
    let _ = std::fs::remove_file(&sock_path);
    info!("armd stopped");
    Ok(())
}

async fn accept_loop(server: Server, tx: mpsc::Sender<ControlRequest>) {
    loop {
        match server.accept().await {
            Ok((conn, caller)) => {
                tokio::spawn(handle_connection(conn, caller, tx.clone()));
            }
            Err(e) => {
                log::error!("accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(mut conn: Connection, caller: CallerInfo, tx: mpsc::Sender<ControlRequest>) {
    info!(
        "connection from uid={} pid={} exe={:?}",
        caller.uid, caller.pid, caller.exe
    );

    let request: Request = match conn.read().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("read error: {}", e);
            let _ = conn.write(&Response::Error("invalid request".into())).await;
            return;
        }
    };

    let (reply, response) = oneshot::channel();
    let response = match tx.send(ControlRequest { request, reply }).await {
        Ok(()) => response
            .await
            .unwrap_or_else(|_| Response::Error("daemon is shutting down".into())),
        Err(_) => Response::Error("daemon is shutting down".into()),
    };

    if let Err(e) = conn.write(&response).await {
        log::error!("write error: {}", e);
    }
}

fn handle_request(request: Request, manager: &mut Manager) -> Response {
    match request {
        Request::Start { service } => match manager.start_service(&service) {
            Ok(pid) => {
                info!("{}: started on request (pid {})", service, pid);
                Response::Status {
                    service,
                    status: ServiceStatus::Up,
                }
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Stop { service } => {
            let status = manager.stop_service(&service);
            Response::Status { service, status }
        }
        Request::StopListening { service } => {
            Response::Stopped(manager.stop_listening(service.as_deref()))
        }
        Request::List => Response::Listening(manager.listening()),
        Request::Ping => Response::Pong,
    }
}

fn dump_state(manager: &Manager) {
    info!("Received {:?}, dumping state", ArmSignal::Usr1);
    for info in manager.listening() {
        info!("  {} at {} ({})", info.service, info.address, info.strategy);
    }
    let launcher = manager.launcher();
    for (name, pid) in launcher.running() {
        match (pid, launcher.next_restart(name)) {
            (Some(pid), _) => info!("  {} running (pid {})", name, pid),
            (None, Some(at)) => info!(
                "  {} restarting in {:?}",
                name,
                at.saturating_duration_since(Instant::now())
            ),
            (None, None) => info!("  {} exited", name),
        }
    }
    info!("  {} relayed connection(s) in flight", manager.active_relays());
}
