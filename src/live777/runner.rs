//! Live777 server supervisor
//!
//! Probes the network periodically and (re)starts Live777 whenever the
//! source address, external address or STUN server changes. The process is
//! respawned if it dies and its output goes to the log.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stun::{Stun, StunInfo};
use crate::config::RunnerConfig;
use crate::error::{AppError, Result};
use crate::utils::default_source_ip;

/// Grace period between SIGTERM and SIGKILL
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause before respawning a dead process
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

const O_STUN_SERVER: &str = "{o_stun_server}";

/// `cmd` without the `remove` parts, followed by `append`
pub fn build_cmd(cmd: &[String], remove: &[String], append: &[String]) -> Vec<String> {
    cmd.iter()
        .filter(|part| !remove.contains(part))
        .chain(append.iter())
        .cloned()
        .collect()
}

/// Placeholder values for a network configuration
pub fn placeholders(netcfg: &StunInfo) -> HashMap<&'static str, String> {
    let o_stun_server = if netcfg.ext_ip.is_empty() {
        String::new()
    } else {
        format!("--stun-server={}:{}", netcfg.stun_ip, netcfg.stun_port)
    };
    HashMap::from([
        ("nat_type", netcfg.nat_type.to_string()),
        ("src_ip", netcfg.src_ip.clone()),
        ("ext_ip", netcfg.ext_ip.clone()),
        ("stun_host", netcfg.stun_host.clone()),
        ("stun_ip", netcfg.stun_ip.clone()),
        ("stun_port", netcfg.stun_port.to_string()),
        ("o_stun_server", o_stun_server),
    ])
}

/// Substitute placeholders; `{o_stun_server}` parts are dropped when the
/// external address is unknown
pub fn render_cmd(cmd: &[String], netcfg: &StunInfo) -> Vec<String> {
    let values = placeholders(netcfg);
    cmd.iter()
        .filter(|part| !(netcfg.ext_ip.is_empty() && part.as_str() == O_STUN_SERVER))
        .map(|part| {
            values.iter().fold(part.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .collect()
}

/// Environment of the Live777 process
pub fn live777_env(config: &RunnerConfig, netcfg: &StunInfo) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "LIVE777_STUN_URL".to_string(),
            format!("stun:{}:{}", netcfg.stun_host, netcfg.stun_port),
        ),
        (
            "LIVE777_VIDEO_SOURCE".to_string(),
            config.video_source.clone(),
        ),
        (
            "LIVE777_AUDIO_SOURCE".to_string(),
            config.audio_source.clone(),
        ),
    ];
    let mut extra: Vec<_> = config.env.iter().collect();
    extra.sort();
    env.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Supervises one Live777 process
pub struct Live777Runner {
    config: RunnerConfig,
    stun: Stun,
    cmd: Vec<String>,
    live777: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Live777Runner {
    pub fn new(config: RunnerConfig) -> Self {
        let cmd = build_cmd(&config.cmd, &config.cmd_remove, &config.cmd_append);
        Self {
            stun: Stun::new(config.stun.clone()),
            config,
            cmd,
            live777: None,
        }
    }

    /// Run until `shutdown` is cancelled, then stop Live777
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Probing the network first time ...");

        let mut prev: Option<StunInfo> = None;
        'outer: loop {
            let attempts = if prev.is_none() {
                1
            } else {
                self.config.check_retries.max(1)
            };

            let mut netcfg = StunInfo::default();
            for attempt in 0..attempts {
                netcfg = tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    netcfg = self.get_netcfg() => netcfg,
                };
                if !netcfg.ext_ip.is_empty() {
                    if attempt > 0 {
                        info!("I'm fine, continue working ...");
                    }
                    break;
                }
                if !sleep_or_cancel(&shutdown, self.config.check_retries_delay()).await {
                    break 'outer;
                }
            }

            if prev.as_ref() != Some(&netcfg) {
                info!("Got new netcfg: {:?}", netcfg);
                self.stop_live777().await;
                if netcfg.src_ip.is_empty() {
                    error!("Empty src_ip; stopping Live777 ...");
                } else {
                    self.start_live777(&netcfg, &shutdown);
                }
                prev = Some(netcfg);
            }

            if !sleep_or_cancel(&shutdown, self.config.check_interval()).await {
                break;
            }
        }

        self.stop_live777().await;
        info!("Bye-bye");
    }

    async fn get_netcfg(&mut self) -> StunInfo {
        let src_ip = default_source_ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        self.stun.get_info(src_ip, 0).await
    }

    fn start_live777(&mut self, netcfg: &StunInfo, shutdown: &CancellationToken) {
        info!("Starting Live777 ...");
        let cmd = render_cmd(&self.cmd, netcfg);
        let env = live777_env(&self.config, netcfg);
        let token = shutdown.child_token();
        let task = tokio::spawn(supervise(cmd, env, token.clone()));
        self.live777 = Some((token, task));
    }

    async fn stop_live777(&mut self) {
        if let Some((token, task)) = self.live777.take() {
            info!("Stopping Live777 ...");
            token.cancel();
            if let Err(e) = task.await {
                warn!("Live777 supervisor failed: {}", e);
            }
        }
    }
}

/// Keep `cmd` running until `token` is cancelled
pub async fn supervise(cmd: Vec<String>, env: Vec<(String, String)>, token: CancellationToken) {
    loop {
        match spawn_process(&cmd, &env) {
            Ok(mut child) => {
                let pid = child.id();
                info!("Started Live777 pid={:?}: {}", pid, cmd.join(" "));
                forward_output(&mut child);

                tokio::select! {
                    _ = token.cancelled() => {
                        kill_process(&mut child, KILL_TIMEOUT).await;
                        break;
                    }
                    status = child.wait() => match status {
                        Ok(status) => error!("Live777 unexpectedly died: pid={:?}, {}", pid, status),
                        Err(e) => error!("Unexpected Live777 error: pid={:?}: {}", pid, e),
                    }
                }
                kill_process(&mut child, KILL_TIMEOUT).await;
            }
            Err(e) => error!("Can't start Live777: {}", e),
        }

        if !sleep_or_cancel(&token, RESPAWN_DELAY).await {
            break;
        }
    }
}

fn spawn_process(cmd: &[String], env: &[(String, String)]) -> Result<Child> {
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| AppError::Process("Empty command".to_string()))?;
    Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Process(format!("Failed to start {}: {}", program, e)))
}

fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_lines(stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_lines(stderr));
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("Live777: {}", line),
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading Live777 output: {}", e);
                break;
            }
        }
    }
}

/// SIGTERM, then SIGKILL if the process outlives `wait`
pub async fn kill_process(child: &mut Child, wait: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("Can't send SIGTERM to pid={}: {}", pid, e);
    }
    match tokio::time::timeout(wait, child.wait()).await {
        Ok(Ok(status)) => info!("Process pid={} finished: {}", pid, status),
        Ok(Err(e)) => warn!("Can't wait for pid={}: {}", pid, e),
        Err(_) => {
            warn!("Process pid={} is still alive after SIGTERM; killing", pid);
            if let Err(e) = child.kill().await {
                warn!("Can't kill pid={}: {}", pid, e);
            }
        }
    }
}

/// Sleep unless cancelled first; false means cancelled
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live777::stun::StunNatType;
    use std::time::Instant;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn netcfg(ext_ip: &str) -> StunInfo {
        StunInfo {
            nat_type: StunNatType::FullConeNat,
            src_ip: "192.168.1.10".to_string(),
            ext_ip: ext_ip.to_string(),
            stun_host: "stun.example.com".to_string(),
            stun_ip: "198.51.100.1".to_string(),
            stun_port: 3478,
        }
    }

    #[test]
    fn test_build_cmd() {
        let cmd = build_cmd(
            &strings(&["/usr/bin/live777", "--bind={src_ip}:7777", "--verbose"]),
            &strings(&["--verbose"]),
            &strings(&["--extra"]),
        );
        assert_eq!(cmd, strings(&["/usr/bin/live777", "--bind={src_ip}:7777", "--extra"]));
    }

    #[test]
    fn test_render_cmd_with_ext_ip() {
        let cmd = strings(&[
            "/usr/bin/live777",
            "--bind={src_ip}:7777",
            "{o_stun_server}",
            "--nat={nat_type}",
        ]);
        assert_eq!(
            render_cmd(&cmd, &netcfg("203.0.113.5")),
            strings(&[
                "/usr/bin/live777",
                "--bind=192.168.1.10:7777",
                "--stun-server=198.51.100.1:3478",
                "--nat=Full Cone NAT",
            ])
        );
    }

    #[test]
    fn test_render_cmd_without_ext_ip() {
        let cmd = strings(&["/usr/bin/live777", "{o_stun_server}", "--ext={ext_ip}"]);
        assert_eq!(
            render_cmd(&cmd, &netcfg("")),
            strings(&["/usr/bin/live777", "--ext="])
        );
    }

    #[test]
    fn test_env() {
        let mut config = RunnerConfig::default();
        config.env.insert("RUST_LOG".to_string(), "debug".to_string());
        let env = live777_env(&config, &netcfg(""));
        assert_eq!(
            env[0],
            (
                "LIVE777_STUN_URL".to_string(),
                "stun:stun.example.com:3478".to_string()
            )
        );
        assert_eq!(env[1].1, "kvmd::ustreamer::h264");
        assert_eq!(env[2].1, "hw:tc358743,0");
        assert_eq!(env[3], ("RUST_LOG".to_string(), "debug".to_string()));
    }

    #[test]
    fn test_empty_cmd() {
        assert!(matches!(spawn_process(&[], &[]), Err(AppError::Process(_))));
    }

    #[tokio::test]
    async fn test_supervise_stops_on_cancel() {
        let token = CancellationToken::new();
        let task = tokio::spawn(supervise(strings(&["sleep", "30"]), vec![], token.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_kill_escalates_to_sigkill() {
        let mut child = spawn_process(
            &strings(&["sh", "-c", "trap '' TERM; sleep 30"]),
            &[],
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        kill_process(&mut child, Duration::from_millis(300)).await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
