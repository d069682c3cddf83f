//! TCP reachability probing for well-known addresses.
//!
//! [`can_connect`] is an advisory boolean probe: it decides whether a seed
//! address is currently live, it does not establish the actual cluster
//! channel. It never returns an error.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, error};

/// Fixed bound on a single probe attempt.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe whether a TCP connection can be established to `host:port`.
///
/// Refused connections and connect timeouts are the expected "nothing is
/// listening yet" signal and are reported as `false` without error-level
/// logging. Any other failure (DNS resolution, unreachable network) is
/// logged at error severity because it may indicate a configuration problem
/// worth operator attention, but still yields `false`.
///
/// The connect blocks the calling task for up to [`PROBE_TIMEOUT`]; do not
/// await it from a task that also services membership notifications.
pub async fn can_connect(host: &str, port: u16) -> bool {
    can_connect_with_timeout(host, port, PROBE_TIMEOUT).await
}

/// [`can_connect`] with an explicit timeout (tests use short bounds).
pub async fn can_connect_with_timeout(host: &str, port: u16, timeout: Duration) -> bool {
    let target = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect(target.as_str())).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::TimedOut) {
                debug!(%target, "member not reachable: {e}");
            } else {
                error!(%target, "cannot connect to member: {e}");
            }
            false
        }
        Err(_elapsed) => {
            debug!(%target, "connect timed out after {timeout:?}");
            false
        }
    }
}
