//! Network reachability

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

/// Whether the remote authority can currently be reached
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Shared online/offline switch
#[derive(Debug, Clone)]
pub struct NetworkStatus(Arc<AtomicBool>);

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Try a TCP connection to the host of `url` within `timeout`
pub async fn probe_reachable(url: &str, timeout: Duration) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        tracing::debug!("Cannot probe malformed URL {url}");
        return false;
    };
    let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) else {
        return false;
    };

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(error)) => {
            tracing::debug!("{host}:{port} unreachable: {error}");
            false
        }
        Err(_) => {
            tracing::debug!("{host}:{port} probe timed out after {timeout:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn network_status_switches() {
        let status = NetworkStatus::offline();
        let shared = status.clone();
        assert!(!status.is_online());
        shared.set_online(true);
        assert!(status.is_online());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe_reachable(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2)).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_rejects_malformed_url() {
        assert!(!probe_reachable("not a url", Duration::from_millis(50)).await);
    }
}
