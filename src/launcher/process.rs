//! Process spawning and supervision
//!
//! Every started service is kept under watch until it is stopped. A service
//! that dies on its own is restarted by the maintenance pass, with a delay
//! that doubles on each consecutive failure.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::{LaunchError, ServiceLauncher, ServiceStatus};
use crate::activation::{InheritedSockets, LISTEN_FDS_START};
use crate::config::{ArmConfig, ServiceConfig};

/// Environment variable telling a service how many sockets it inherited
pub const LISTEN_FDS_ENV: &str = "LISTEN_FDS";

/// Delay before the first restart of a service that died
pub const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of the restart delay. A service that stayed up this long
/// starts over from [`INITIAL_RESTART_DELAY`].
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// One started service
struct Supervised {
    /// `None` while waiting to be restarted
    child: Option<Child>,
    /// Start requests not yet matched by a stop
    refs: u32,
    /// SIGTERM was sent on request; do not restart
    stopping: bool,
    started_at: Instant,
    restart_delay: Duration,
    restart_at: Option<Instant>,
}

impl Supervised {
    fn new(child: Child) -> Self {
        Self {
            child: Some(child),
            refs: 1,
            stopping: false,
            started_at: Instant::now(),
            restart_delay: INITIAL_RESTART_DELAY,
            restart_at: None,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Schedule the next restart attempt and back off further
    fn schedule_restart(&mut self, now: Instant) -> Duration {
        let delay = self.restart_delay;
        self.restart_at = Some(now + delay);
        self.restart_delay = (delay * 2).min(MAX_RESTART_DELAY);
        delay
    }
}

/// Launches services as child processes of the daemon
pub struct ProcessLauncher {
    config: ArmConfig,
    services: HashMap<String, Supervised>,
}

impl ProcessLauncher {
    pub fn new(config: ArmConfig) -> Self {
        Self {
            config,
            services: HashMap::new(),
        }
    }

    /// Names and pids of the supervised services. The pid is `None` while a
    /// service waits to be restarted.
    pub fn running(&self) -> impl Iterator<Item = (&str, Option<u32>)> {
        self.services.iter().map(|(name, svc)| (name.as_str(), svc.pid()))
    }

    /// When `name` is due to be restarted, if it is waiting for that
    pub fn next_restart(&self, name: &str) -> Option<Instant> {
        self.services.get(name).and_then(|svc| svc.restart_at)
    }

    /// Collect children that exited since the last call.
    ///
    /// Services stopped on request are forgotten. Any other exit schedules a
    /// restart relative to `now`.
    pub fn reap(&mut self, now: Instant) -> Vec<(String, ExitStatus)> {
        let mut exited = Vec::new();
        for (name, svc) in self.services.iter_mut() {
            let Some(child) = svc.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => exited.push((name.clone(), status)),
                Ok(None) => {}
                Err(e) => log::warn!("{}: failed to poll process: {}", name, e),
            }
        }

        for (name, status) in &exited {
            let Some(svc) = self.services.get_mut(name) else {
                continue;
            };
            svc.child = None;

            if svc.stopping {
                log::info!("{}: stopped ({})", name, status);
                self.services.remove(name);
                continue;
            }

            if now.saturating_duration_since(svc.started_at) >= MAX_RESTART_DELAY {
                svc.restart_delay = INITIAL_RESTART_DELAY;
            }
            let delay = svc.schedule_restart(now);
            log::warn!(
                "{}: terminated with {}, restarting in {:?}",
                name,
                status,
                delay
            );
        }
        exited
    }

    /// Restart every service whose restart time has come. Returns how many
    /// were started again.
    pub fn restart_due(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .services
            .iter()
            .filter(|(_, svc)| svc.child.is_none() && svc.restart_at.is_some_and(|at| at <= now))
            .map(|(name, _)| name.clone())
            .collect();

        let mut restarted = 0;
        for name in due {
            let spawned = self.spawn(&name, None);
            let Some(svc) = self.services.get_mut(&name) else {
                continue;
            };
            match spawned {
                Ok(child) => {
                    log::info!("{}: restarted (pid {:?})", name, child.id());
                    svc.child = Some(child);
                    svc.started_at = now;
                    svc.restart_at = None;
                    restarted += 1;
                }
                Err(e) => {
                    let delay = svc.schedule_restart(now);
                    log::error!("{}: restart failed: {}, retrying in {:?}", name, e, delay);
                }
            }
        }
        restarted
    }

    /// Send SIGTERM to every running service, then SIGKILL whatever is
    /// still around after `grace`
    pub async fn terminate_all(&mut self, grace: Duration) {
        for (name, svc) in self.services.iter_mut() {
            svc.stopping = true;
            if let Some(pid) = svc.pid() {
                log::info!("{}: stopping (pid {})", name, pid);
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::warn!("{}: failed to send SIGTERM: {}", name, e);
                }
            }
        }

        for (name, svc) in self.services.drain() {
            let Some(mut child) = svc.child else {
                continue;
            };
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => log::debug!("{}: exited with {}", name, status),
                Ok(Err(e)) => log::warn!("{}: wait failed: {}", name, e),
                Err(_) => {
                    log::warn!("{}: did not exit within {:?}, killing", name, grace);
                    if let Err(e) = child.kill().await {
                        log::error!("{}: failed to kill: {}", name, e);
                    }
                }
            }
        }
    }

    fn spawn(&self, name: &str, inherited: Option<InheritedSockets>) -> Result<Child, LaunchError> {
        let service = self
            .config
            .service(name)
            .ok_or_else(|| LaunchError::UnknownService(name.to_string()))?;

        let (program, args) =
            build_command_line(service, &self.config.global_prefix, self.config.path.as_deref())?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        match &inherited {
            Some(sockets) => {
                let mut fds = sockets.raw_fds();
                cmd.env(LISTEN_FDS_ENV, fds.len().to_string());

                // Runs after fork, before exec
                unsafe {
                    cmd.pre_exec(move || install_inherited_fds(&mut fds));
                }
            }
            None => {
                cmd.env_remove(LISTEN_FDS_ENV);
            }
        }

        log::info!("{}: starting {} {}", name, program, args.join(" "));
        let child = cmd.spawn().map_err(|e| LaunchError::Spawn(e.to_string()))?;

        // The child holds its own copies now
        drop(inherited);
        Ok(child)
    }
}

impl ServiceLauncher for ProcessLauncher {
    fn start_service(
        &mut self,
        name: &str,
        inherited: Option<InheritedSockets>,
    ) -> Result<u32, LaunchError> {
        if let Some(svc) = self.services.get_mut(name) {
            if svc.stopping {
                log::info!("{}: start requested while stopping, will restart", name);
                svc.stopping = false;
            }
            if let Some(pid) = svc.pid() {
                svc.refs += 1;
                log::info!("{}: already running ({} reference(s))", name, svc.refs);
                return Ok(pid);
            }
        }

        let child = self.spawn(name, inherited)?;
        let pid = child.id().unwrap_or_default();

        match self.services.get_mut(name) {
            // Was waiting for a restart
            Some(svc) => {
                svc.refs += 1;
                svc.child = Some(child);
                svc.started_at = Instant::now();
                svc.restart_at = None;
            }
            None => {
                self.services.insert(name.to_string(), Supervised::new(child));
            }
        }
        Ok(pid)
    }

    fn stop_service(&mut self, name: &str) -> ServiceStatus {
        let Some(svc) = self.services.get_mut(name) else {
            log::info!("{}: not running", name);
            return ServiceStatus::Down;
        };

        if svc.refs > 1 {
            svc.refs -= 1;
            log::info!("{}: still wanted ({} reference(s))", name, svc.refs);
            return ServiceStatus::Up;
        }

        match svc.pid() {
            Some(pid) => {
                log::info!("{}: stopping (pid {})", name, pid);
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::warn!("{}: failed to send SIGTERM: {}", name, e);
                }
                svc.refs = 0;
                svc.stopping = true;
                svc.restart_at = None;
            }
            None => {
                log::info!("{}: restart cancelled", name);
                self.services.remove(name);
            }
        }
        ServiceStatus::Down
    }
}

/// Assemble program and arguments for a service.
///
/// The command is `[PREFIX | GLOBAL_PREFIX] BINARY [-c CONFIG] [-L DEBUG] OPTIONS`.
pub fn build_command_line(
    service: &ServiceConfig,
    global_prefix: &str,
    default_config: Option<&Path>,
) -> Result<(String, Vec<String>), LaunchError> {
    let binary = service
        .binary
        .as_deref()
        .ok_or_else(|| LaunchError::NoBinary(service.name.clone()))?;

    let prefix = service.prefix.as_deref().unwrap_or(global_prefix);
    let mut parts = split_words(prefix)?;
    parts.push(binary.to_string());

    if let Some(config) = service.config.as_deref().or(default_config) {
        parts.push("-c".to_string());
        parts.push(config.display().to_string());
    }
    if service.debug {
        parts.push("-L".to_string());
        parts.push("DEBUG".to_string());
    }
    parts.extend(split_words(&service.options)?);

    let program = parts.remove(0);
    Ok((program, parts))
}

fn split_words(s: &str) -> Result<Vec<String>, LaunchError> {
    shlex::split(s).ok_or_else(|| LaunchError::InvalidCommand(s.to_string()))
}

/// Install `fds` at consecutive descriptors starting at [`LISTEN_FDS_START`].
///
/// Every descriptor is first moved above the target range so installing one
/// cannot clobber another that is still waiting to be moved.
fn install_inherited_fds(fds: &mut [RawFd]) -> std::io::Result<()> {
    let floor = LISTEN_FDS_START + fds.len() as RawFd;

    for fd in fds.iter_mut() {
        let staged = unsafe { libc::fcntl(*fd, libc::F_DUPFD, floor) };
        if staged < 0 {
            return Err(std::io::Error::last_os_error());
        }
        *fd = staged;
    }

    for (i, fd) in fds.iter().enumerate() {
        let target = LISTEN_FDS_START + i as RawFd;
        if unsafe { libc::dup2(*fd, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::close(*fd) };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn service(binary: &str) -> ServiceConfig {
        let mut svc = ServiceConfig::new("echo");
        svc.binary = Some(binary.into());
        svc
    }

    #[test]
    fn test_plain_binary() {
        let (program, args) = build_command_line(&service("echo-service"), "", None).unwrap();
        assert_eq!(program, "echo-service");
        assert!(args.is_empty());
    }

    #[test]
    fn test_full_command_line() {
        let mut svc = service("gnunet-service-echo");
        svc.debug = true;
        svc.options = "--verbose --name 'two words'".into();

        let (program, args) = build_command_line(
            &svc,
            "nice -n 5",
            Some(Path::new("/etc/armd/armd.conf")),
        )
        .unwrap();

        assert_eq!(program, "nice");
        assert_eq!(
            args,
            vec![
                "-n",
                "5",
                "gnunet-service-echo",
                "-c",
                "/etc/armd/armd.conf",
                "-L",
                "DEBUG",
                "--verbose",
                "--name",
                "two words",
            ]
        );
    }

    #[test]
    fn test_service_prefix_overrides_global() {
        let mut svc = service("echo-service");
        svc.prefix = Some("valgrind".into());
        svc.config = Some(PathBuf::from("/etc/echo.conf"));

        let (program, args) =
            build_command_line(&svc, "nice", Some(Path::new("/etc/armd.conf"))).unwrap();
        assert_eq!(program, "valgrind");
        assert_eq!(args, vec!["echo-service", "-c", "/etc/echo.conf"]);
    }

    #[test]
    fn test_missing_binary() {
        let svc = ServiceConfig::new("echo");
        assert!(matches!(
            build_command_line(&svc, "", None),
            Err(LaunchError::NoBinary(name)) if name == "echo"
        ));
    }

    #[test]
    fn test_unbalanced_quotes() {
        let mut svc = service("echo-service");
        svc.options = "--name 'oops".into();
        assert!(matches!(
            build_command_line(&svc, "", None),
            Err(LaunchError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let mut launcher = ProcessLauncher::new(ArmConfig::default());
        assert!(matches!(
            launcher.start_service("nope", None),
            Err(LaunchError::UnknownService(_))
        ));
        assert_eq!(launcher.stop_service("nope"), ServiceStatus::Down);
    }

    /// A launcher knowing `name` as `sh -c <script>`
    fn shell_launcher(name: &str, script: &str) -> ProcessLauncher {
        let mut svc = ServiceConfig::new(name);
        svc.binary = Some("sh".into());
        svc.options = format!("-c '{}'", script);

        let mut config = ArmConfig::default();
        config.services.insert(name.to_string(), svc);
        ProcessLauncher::new(config)
    }

    /// Reap until something exits, returning the instant it was noticed
    async fn wait_for_exit(launcher: &mut ProcessLauncher) -> (Instant, Vec<(String, ExitStatus)>) {
        for _ in 0..250 {
            let now = Instant::now();
            let exited = launcher.reap(now);
            if !exited.is_empty() {
                return (now, exited);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no child exited within 5s");
    }

    fn pid_of(launcher: &ProcessLauncher, name: &str) -> Option<u32> {
        launcher
            .running()
            .find(|(n, _)| *n == name)
            .and_then(|(_, pid)| pid)
    }

    #[tokio::test]
    async fn test_crashed_service_is_restarted_with_backoff() {
        let mut launcher = shell_launcher("flaky", "exit 3");
        launcher.start_service("flaky", None).unwrap();

        let (first, exited) = wait_for_exit(&mut launcher).await;
        assert_eq!(exited[0].0, "flaky");
        assert_eq!(exited[0].1.code(), Some(3));
        assert_eq!(pid_of(&launcher, "flaky"), None);
        assert_eq!(
            launcher.next_restart("flaky"),
            Some(first + INITIAL_RESTART_DELAY)
        );

        // Not due yet
        assert_eq!(launcher.restart_due(first), 0);
        assert_eq!(launcher.restart_due(first + INITIAL_RESTART_DELAY), 1);
        assert!(pid_of(&launcher, "flaky").is_some());
        assert_eq!(launcher.next_restart("flaky"), None);

        // Dying again right away doubles the delay
        let (second, _) = wait_for_exit(&mut launcher).await;
        assert_eq!(
            launcher.next_restart("flaky"),
            Some(second + INITIAL_RESTART_DELAY * 2)
        );
    }

    #[tokio::test]
    async fn test_stopped_service_is_not_restarted() {
        let mut launcher = shell_launcher("sleeper", "sleep 30");
        launcher.start_service("sleeper", None).unwrap();

        assert_eq!(launcher.stop_service("sleeper"), ServiceStatus::Down);
        let (now, exited) = wait_for_exit(&mut launcher).await;
        assert_eq!(exited[0].0, "sleeper");

        assert_eq!(launcher.running().count(), 0);
        assert_eq!(launcher.next_restart("sleeper"), None);
        assert_eq!(launcher.restart_due(now + MAX_RESTART_DELAY), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_counted() {
        let mut launcher = shell_launcher("sleeper", "sleep 30");
        let pid = launcher.start_service("sleeper", None).unwrap();
        assert_eq!(launcher.start_service("sleeper", None).unwrap(), pid);

        assert_eq!(launcher.stop_service("sleeper"), ServiceStatus::Up);
        assert_eq!(pid_of(&launcher, "sleeper"), Some(pid));

        assert_eq!(launcher.stop_service("sleeper"), ServiceStatus::Down);
        wait_for_exit(&mut launcher).await;
        assert_eq!(launcher.running().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let mut launcher = shell_launcher("flaky", "exit 1");
        launcher.start_service("flaky", None).unwrap();
        let (now, _) = wait_for_exit(&mut launcher).await;
        assert!(launcher.next_restart("flaky").is_some());

        assert_eq!(launcher.stop_service("flaky"), ServiceStatus::Down);
        assert_eq!(launcher.restart_due(now + MAX_RESTART_DELAY), 0);
        assert_eq!(launcher.running().count(), 0);
    }
}
