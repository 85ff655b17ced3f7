//! Private overlay network membership
//!
//! The relay only needs three things from an overlay: join it under a hostname,
//! listen on the overlay address, and leave it again. The production backend
//! runs a dedicated `tailscaled` whose state lives in the configured state dir.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long to wait between overlay status polls
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait between polls while the daemon starts
const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between SIGTERM and SIGKILL when stopping the daemon
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for joining the overlay
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub hostname: String,
    pub state_dir: PathBuf,
    pub ephemeral: bool,
    /// Pre-authorized key; required unless identity is already persisted
    pub auth_key: Option<String>,
    pub join_timeout: Duration,
    pub verbose: bool,
}

/// Identity on the overlay network, valid for the life of the process
#[derive(Debug, Clone)]
pub struct OverlaySession {
    pub hostname: String,
    pub state_dir: PathBuf,
    pub ephemeral: bool,
    pub addresses: Vec<IpAddr>,
    /// Fully qualified name assigned by the overlay, if any
    pub dns_name: Option<String>,
}

impl OverlaySession {
    /// Preferred address to listen on (IPv4 first)
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }

    /// Name to show operators
    pub fn display_name(&self) -> &str {
        self.dns_name.as_deref().unwrap_or(&self.hostname)
    }
}

/// A private overlay network the relay can join
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Join the overlay and wait until an address is assigned
    async fn up(&self, config: &OverlayConfig) -> Result<OverlaySession>;

    /// Open a listener reachable only through the overlay
    async fn listen(&self, session: &OverlaySession, port: u16) -> Result<TcpListener> {
        let ip = session
            .primary_address()
            .ok_or_else(|| anyhow!("Overlay session has no address"))?;
        let addr = SocketAddr::new(ip, port);
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on overlay address {}", addr))
    }

    /// Leave the overlay
    async fn down(&self) -> Result<()>;

    /// Human-readable name for this overlay backend
    fn name(&self) -> &'static str;
}

/// Overlay that never leaves the machine; every "overlay" address is loopback.
///
/// Used by the test suite and for bench setups without overlay credentials.
#[derive(Debug, Default)]
pub struct LoopbackOverlay;

#[async_trait]
impl Overlay for LoopbackOverlay {
    async fn up(&self, config: &OverlayConfig) -> Result<OverlaySession> {
        Ok(OverlaySession {
            hostname: config.hostname.clone(),
            state_dir: config.state_dir.clone(),
            ephemeral: config.ephemeral,
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            dns_name: None,
        })
    }

    async fn down(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

/// Subset of `tailscale status --json` the relay cares about
#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(rename = "BackendState", default)]
    backend_state: String,
    #[serde(rename = "AuthURL", default)]
    auth_url: String,
    #[serde(rename = "Self")]
    self_status: Option<SelfStatus>,
}

#[derive(Debug, Deserialize)]
struct SelfStatus {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Option<Vec<IpAddr>>,
}

/// Parsed overlay status
#[derive(Debug, PartialEq)]
enum JoinState {
    /// Joined with at least one address
    Ready {
        addresses: Vec<IpAddr>,
        dns_name: Option<String>,
    },
    /// The control plane rejected or still wants credentials
    NeedsAuth { auth_url: Option<String> },
    /// Still starting or connecting
    Pending(String),
}

fn parse_status(json: &str) -> Result<JoinState> {
    let status: StatusJson = serde_json::from_str(json).context("Invalid overlay status JSON")?;

    match status.backend_state.as_str() {
        "NeedsLogin" | "NeedsMachineAuth" => Ok(JoinState::NeedsAuth {
            auth_url: Some(status.auth_url).filter(|u| !u.is_empty()),
        }),
        "Running" => {
            let (addresses, dns_name) = status
                .self_status
                .map(|s| {
                    let dns = s.dns_name.trim_end_matches('.').to_string();
                    (s.tailscale_ips.unwrap_or_default(), Some(dns).filter(|d| !d.is_empty()))
                })
                .unwrap_or_default();

            if addresses.is_empty() {
                Ok(JoinState::Pending("Running without address".into()))
            } else {
                Ok(JoinState::Ready { addresses, dns_name })
            }
        }
        other => Ok(JoinState::Pending(other.to_string())),
    }
}

/// Delete a control socket left behind by a daemon that did not exit cleanly
fn remove_stale_socket(socket: &Path) -> Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => {
            debug!("Removed stale overlay socket {}", socket.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove stale socket {}", socket.display())),
    }
}

/// The daemon answers once `status --json` yields a parseable status, whatever
/// its backend state
fn daemon_answering(stdout: &str) -> bool {
    parse_status(stdout).is_ok()
}

/// Ask the daemon to exit, then kill it if it is still running after `grace`.
/// Returns `true` when it exited on its own.
async fn stop_daemon(child: &mut Child, grace: Duration) -> Result<bool> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signals a child we spawned and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!("SIGTERM to overlay daemon failed: {}", std::io::Error::last_os_error());
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status.context("Failed to wait for tailscaled")?;
            debug!("Overlay daemon exited: {}", status);
            Ok(true)
        }
        Err(_) => {
            warn!("Overlay daemon ignored SIGTERM for {:?}, killing it", grace);
            child.kill().await.context("Failed to stop tailscaled")?;
            Ok(false)
        }
    }
}

/// Overlay backed by a private `tailscaled` process
pub struct TailscaleOverlay {
    /// Name of the tun device the daemon creates
    tun: String,
    daemon: Mutex<Option<Child>>,
    socket: Mutex<Option<PathBuf>>,
}

impl TailscaleOverlay {
    pub fn new(tun: impl Into<String>) -> Self {
        Self {
            tun: tun.into(),
            daemon: Mutex::new(None),
            socket: Mutex::new(None),
        }
    }

    async fn cli(socket: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("tailscale")
            .arg("--socket")
            .arg(socket)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run tailscale {}", args.join(" ")))
    }

    /// Poll until the daemon answers on its socket
    async fn wait_daemon(socket: &Path) -> Result<()> {
        loop {
            if socket.exists() {
                let output = Self::cli(socket, &["status", "--json"]).await?;
                if daemon_answering(&String::from_utf8_lossy(&output.stdout)) {
                    debug!("Overlay daemon is answering");
                    return Ok(());
                }
            }
            tokio::time::sleep(DAEMON_POLL_INTERVAL).await;
        }
    }

    async fn wait_joined(socket: &Path) -> Result<(Vec<IpAddr>, Option<String>)> {
        loop {
            let output = Self::cli(socket, &["status", "--json"]).await?;
            let json = String::from_utf8_lossy(&output.stdout);

            match parse_status(&json) {
                Ok(JoinState::Ready { addresses, dns_name }) => return Ok((addresses, dns_name)),
                Ok(JoinState::NeedsAuth { auth_url }) => {
                    if let Some(url) = auth_url {
                        warn!("Overlay login required: {}", url);
                    }
                    bail!("Overlay authentication failed (backend needs login)");
                }
                Ok(JoinState::Pending(state)) => info!("Waiting for overlay address ({})...", state),
                Err(e) => debug!("Overlay status not ready: {}", e),
            }

            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Overlay for TailscaleOverlay {
    async fn up(&self, config: &OverlayConfig) -> Result<OverlaySession> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!("Failed to create state directory {}", config.state_dir.display())
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config.state_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let state_file = config.state_dir.join("tailscaled.state");
        let has_identity = !config.ephemeral && state_file.exists();
        if config.auth_key.is_none() && !has_identity {
            bail!("TS_AUTHKEY environment variable is not set. An auth key is required for headless operation.");
        }

        let socket = config.state_dir.join("tailscaled.sock");
        let state_arg = if config.ephemeral {
            "mem:".to_string()
        } else {
            state_file.display().to_string()
        };

        remove_stale_socket(&socket)?;

        info!("Starting overlay daemon (tun {}, state {})", self.tun, state_arg);
        let child = Command::new("tailscaled")
            .arg(format!("--state={}", state_arg))
            .arg("--statedir")
            .arg(&config.state_dir)
            .arg("--socket")
            .arg(&socket)
            .arg(format!("--tun={}", self.tun))
            .arg("--port=0")
            .stdin(Stdio::null())
            .stdout(if config.verbose { Stdio::inherit() } else { Stdio::null() })
            .stderr(if config.verbose { Stdio::inherit() } else { Stdio::null() })
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start tailscaled")?;
        *self.daemon.lock().await = Some(child);
        *self.socket.lock().await = Some(socket.clone());

        let join = async {
            Self::wait_daemon(&socket).await?;

            let timeout_arg = format!("--timeout={}s", config.join_timeout.as_secs());
            let hostname_arg = format!("--hostname={}", config.hostname);
            let auth_arg = config.auth_key.as_ref().map(|key| format!("--authkey={}", key));
            let mut args = vec!["up", hostname_arg.as_str(), timeout_arg.as_str()];
            if let Some(auth_arg) = &auth_arg {
                args.push(auth_arg.as_str());
            }

            info!("Connecting to overlay as {}...", config.hostname);
            let up = Self::cli(&socket, &args).await?;
            if !up.status.success() {
                bail!(
                    "Overlay authentication failed: {}",
                    String::from_utf8_lossy(&up.stderr).trim()
                );
            }

            Self::wait_joined(&socket).await
        };

        let (addresses, dns_name) = tokio::time::timeout(config.join_timeout, join)
            .await
            .map_err(|_| anyhow!("Timed out waiting for overlay address after {:?}", config.join_timeout))??;

        let session = OverlaySession {
            hostname: config.hostname.clone(),
            state_dir: config.state_dir.clone(),
            ephemeral: config.ephemeral,
            addresses,
            dns_name,
        };
        info!(
            "Overlay connected as {} (IP: {:?})",
            session.display_name(),
            session.primary_address()
        );
        Ok(session)
    }

    async fn down(&self) -> Result<()> {
        let socket = self.socket.lock().await.take();
        if let Some(socket) = &socket {
            if let Err(e) = Self::cli(socket, &["down"]).await {
                debug!("tailscale down failed: {}", e);
            }
        }

        if let Some(mut child) = self.daemon.lock().await.take() {
            stop_daemon(&mut child, DAEMON_STOP_TIMEOUT).await?;
        }
        if let Some(socket) = &socket {
            remove_stale_socket(socket)?;
        }

        info!("Left overlay network");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tailscale"
    }
}
