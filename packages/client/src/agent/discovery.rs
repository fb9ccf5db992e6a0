//! Agent discovery
//!
//! Probes the candidate loopback addresses for a running agent, gates on the
//! minimum supported version, and drives the agent's self-update when the
//! version is too old. Discovery never gives up: until an agent is found the
//! scan repeats on a fixed interval, because nothing else in this crate can
//! function without one.

use std::cmp::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::agent::daemon::ChannelStatus;
use crate::connection::protocol::{AgentInfo, UpdateReply};
use crate::error::DiscoveryError;
use crate::state::StateChannel;

/// Minimum agent version this client accepts.
pub const MIN_VERSION: &str = "1.1.76";
/// Versions carrying this marker are development builds and always accepted.
const DEV_VERSION_MARKER: &str = "dev";

/// Default candidate base addresses, in default priority order. The embedding
/// environment may prefer the secure host first; the order is fixed at
/// construction.
pub const LOOPBACK_ADDRESS: &str = "http://127.0.0.1";
pub const LOOPBACK_HOST: &str = "https://localhost";

const LOOKUP_PORT_START: u16 = 8991;
const LOOKUP_PORT_END: u16 = 9000;
const POLLING_INTERVAL: Duration = Duration::from_millis(2500);
const UPDATE_RETRY_DELAY: Duration = Duration::from_secs(10);
const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Update sources outside this domain are flagged as unofficial.
const OFFICIAL_UPDATE_DOMAIN: &str = "downloads.boardlink.dev";

/// Channel scheme selected by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Insecure,
    Secure,
}

/// A located agent. Built wholesale on discovery and replaced wholesale on
/// reconnect, never partially mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub scheme: Scheme,
    /// HTTP base address for `/upload`, `/update` and `/pause`.
    pub base: String,
    /// Websocket address for the persistent channel.
    pub socket: String,
    pub version: String,
    pub update_url: String,
}

/// Per-discovery-session state: the update-attempt counter lives here rather
/// than in process-wide mutable state.
#[derive(Debug, Default)]
struct DiscoveryContext {
    update_attempts: u32,
}

pub struct AgentLocator {
    http: reqwest::Client,
    candidates: Vec<String>,
    errors: broadcast::Sender<String>,
    channel_status: StateChannel<ChannelStatus>,
}

impl AgentLocator {
    /// `errors` receives non-fatal notices (unofficial source, proxy error,
    /// incompatible version); `channel_status` is settled to `Closed` by the
    /// first scan that comes up empty.
    pub fn new(
        candidates: Vec<String>,
        errors: broadcast::Sender<String>,
        channel_status: StateChannel<ChannelStatus>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            candidates,
            errors,
            channel_status,
        }
    }

    /// Scan until an agent is found. Candidates are tried in priority order;
    /// when none matches, the whole scan repeats after the polling interval.
    pub async fn discover(&self) -> AgentEndpoint {
        let mut ctx = DiscoveryContext::default();
        loop {
            for candidate in &self.candidates {
                match self.try_host(candidate, &mut ctx).await {
                    Ok(endpoint) => {
                        info!(
                            base = %endpoint.base,
                            version = %endpoint.version,
                            "agent found"
                        );
                        return endpoint;
                    }
                    Err(err) => debug!(host = %candidate, error = %err, "agent not found"),
                }
            }
            tokio::time::sleep(POLLING_INTERVAL).await;
        }
    }

    /// Probe every lookup port of one candidate in parallel and accept the
    /// first 200 response; then gate on the reported version.
    async fn try_host(
        &self,
        base: &str,
        ctx: &mut DiscoveryContext,
    ) -> Result<AgentEndpoint, DiscoveryError> {
        let probes = (LOOKUP_PORT_START..LOOKUP_PORT_END).map(|port| self.probe(base, port));
        let hit = futures_util::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .next();

        let Some((url, info)) = hit else {
            // First scan that comes up empty settles the channel state.
            if self.channel_status.get() == ChannelStatus::Pending {
                self.channel_status.set(ChannelStatus::Closed);
            }
            return Err(DiscoveryError::NotFound(base.to_string()));
        };

        if !info.update_url.contains(OFFICIAL_UPDATE_DOMAIN) {
            let _ = self.errors.send("unofficial agent".to_string());
        }

        let endpoint = if url.scheme() == "https" {
            AgentEndpoint {
                scheme: Scheme::Secure,
                base: info.https.clone().ok_or(DiscoveryError::IncompleteInfo)?,
                socket: info.wss.clone().ok_or(DiscoveryError::IncompleteInfo)?,
                version: info.version.clone(),
                update_url: info.update_url.clone(),
            }
        } else {
            // Old agents report a bare hostname over http; force the loopback IP.
            AgentEndpoint {
                scheme: Scheme::Insecure,
                base: info
                    .http
                    .clone()
                    .ok_or(DiscoveryError::IncompleteInfo)?
                    .replace("localhost", "127.0.0.1"),
                socket: info.ws.clone().ok_or(DiscoveryError::IncompleteInfo)?,
                version: info.version.clone(),
                update_url: info.update_url.clone(),
            }
        };

        if version_accepted(&endpoint.version) {
            return Ok(endpoint);
        }

        ctx.update_attempts += 1;
        if ctx.update_attempts > MAX_UPDATE_ATTEMPTS {
            let _ = self.errors.send("agent version incompatible".to_string());
            return Err(DiscoveryError::IncompatibleVersion);
        }
        if ctx.update_attempts > 1 {
            tokio::time::sleep(UPDATE_RETRY_DELAY).await;
        }
        Err(self.update(&endpoint.base).await)
    }

    async fn probe(&self, base: &str, port: u16) -> Option<(reqwest::Url, AgentInfo)> {
        let url = format!("{}:{}/info", base, port);
        // Most probes fail; that is the expected shape of the fan-out.
        let response = self.http.get(&url).send().await.ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        let final_url = response.url().clone();
        let info = response.json::<AgentInfo>().await.ok()?;
        Some((final_url, info))
    }

    /// Ask the agent to update itself. Whatever the reply, the agent is
    /// assumed to be restarting, so this always yields an error and the
    /// rescan loop keeps looking for the new process.
    pub async fn update(&self, base: &str) -> DiscoveryError {
        match self
            .http
            .post(format!("{}/update", base))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .send()
            .await
        {
            Ok(response) => {
                if let Ok(reply) = response.json::<UpdateReply>().await {
                    let proxied = reply
                        .error
                        .as_deref()
                        .is_some_and(|e| e.contains("proxy") || e.contains("dial tcp"));
                    if !reply.ok && proxied {
                        let _ = self.errors.send("proxy error".to_string());
                    }
                }
            }
            Err(err) => warn!(error = %err, "agent update request failed"),
        }
        DiscoveryError::AgentRestarting
    }
}

/// Development builds are always accepted; released versions must be at
/// least [`MIN_VERSION`].
pub fn version_accepted(version: &str) -> bool {
    version.contains(DEV_VERSION_MARKER)
        || compare_versions(version, MIN_VERSION) != Ordering::Less
}

/// Numeric dotted-segment comparison; missing segments count as zero and
/// non-numeric suffixes are ignored.
fn compare_versions(a: &str, b: &str) -> Ordering {
    fn segments(version: &str) -> Vec<u64> {
        version
            .split('.')
            .map(|seg| {
                seg.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    }
    let (va, vb) = (segments(a), segments(b));
    for i in 0..va.len().max(vb.len()) {
        let x = va.get(i).copied().unwrap_or(0);
        let y = vb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn compares_versions_numerically() {
        assert_eq!(compare_versions("1.1.76", "1.1.76"), Ordering::Equal);
        assert_eq!(compare_versions("1.1.77", "1.1.76"), Ordering::Greater);
        assert_eq!(compare_versions("1.1.9", "1.1.76"), Ordering::Less);
        assert_eq!(compare_versions("1.2", "1.1.76"), Ordering::Greater);
        assert_eq!(compare_versions("1.1.76", "1.1.76.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0-rc1", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn version_gate_accepts_dev_builds_and_new_enough_releases() {
        assert!(version_accepted("1.1.76"));
        assert!(version_accepted("1.2.0"));
        assert!(version_accepted("1.0.0-dev"));
        assert!(!version_accepted("1.1.75"));
        assert!(!version_accepted("0.9.0"));
    }

    /// A one-shot HTTP agent stub: answers `/info` with the given version and
    /// `/update` with an ok reply, recording every request line it sees.
    async fn spawn_stub(port: u16, version: &str) -> Arc<Mutex<Vec<String>>> {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind stub agent");
        let seen = Arc::clone(&requests);
        let version = version.to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let seen = Arc::clone(&seen);
                let version = version.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let first_line = request.lines().next().unwrap_or("").to_string();
                    seen.lock().push(first_line.clone());
                    let body = if first_line.starts_with("POST /update") {
                        r#"{"ok": true}"#.to_string()
                    } else {
                        format!(
                            concat!(
                                r#"{{"version": "{version}", "#,
                                r#""update_url": "https://downloads.boardlink.dev/agent", "#,
                                r#""http": "http://localhost:{port}", "#,
                                r#""ws": "ws://localhost:{port}"}}"#
                            ),
                            version = version,
                            port = port
                        )
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        requests
    }

    fn locator(candidates: Vec<String>) -> (AgentLocator, StateChannel<ChannelStatus>) {
        let (errors, _) = broadcast::channel(16);
        let status = StateChannel::new(ChannelStatus::Pending);
        (
            AgentLocator::new(candidates, errors, status.clone()),
            status,
        )
    }

    #[tokio::test]
    async fn rescan_keeps_looking_without_terminating() {
        // A candidate that can never yield a valid probe URL.
        let (locator, status) = locator(vec!["http://127.0.0.1:1".to_string()]);

        let result =
            tokio::time::timeout(Duration::from_millis(500), locator.discover()).await;

        assert!(result.is_err(), "discovery must keep scanning, not settle");
        assert_eq!(status.get(), ChannelStatus::Closed);
    }

    // The stub listeners live for the rest of the process, and every probe
    // sweeps the whole lookup port range, so the outdated-agent phase has to
    // run before the accepted-agent stub exists. One sequential test.
    #[tokio::test]
    async fn version_gate_and_probe_selection_against_stub_agents() {
        // Phase 1: only an outdated agent is reachable. It is never accepted
        // and an update attempt is issued.
        let outdated = spawn_stub(8996, "1.0.0").await;
        let (loc, _) = locator(vec![LOOPBACK_ADDRESS.to_string()]);

        let result = tokio::time::timeout(Duration::from_secs(1), loc.discover()).await;
        assert!(result.is_err(), "an outdated agent is never accepted");
        assert!(outdated
            .lock()
            .iter()
            .any(|line| line.starts_with("POST /update")));

        // Phase 2: a compatible agent appears on a lower port and wins the
        // sweep; it is accepted without any update call.
        let accepted = spawn_stub(8993, "1.2.0").await;
        let (loc, _) = locator(vec![LOOPBACK_ADDRESS.to_string()]);

        let endpoint = tokio::time::timeout(Duration::from_secs(2), loc.discover())
            .await
            .expect("discovery should settle on the stub agent");

        assert_eq!(endpoint.scheme, Scheme::Insecure);
        // Reported hostname is normalized to the explicit loopback IP.
        assert_eq!(endpoint.base, "http://127.0.0.1:8993");
        assert_eq!(endpoint.socket, "ws://localhost:8993");
        assert_eq!(endpoint.version, "1.2.0");
        assert!(accepted
            .lock()
            .iter()
            .all(|line| !line.starts_with("POST /update")));
    }
}
