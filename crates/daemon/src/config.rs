use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    pub db_url: String,

    /// Claims untouched for longer than this are recycled.
    pub liveness_window: Duration,
    pub reconcile_interval: Duration,
    pub default_max_attempts: u32,

    pub decrypt_command: String,
    pub decrypt_args: Vec<String>,
    pub decrypt_timeout: Duration,

    /// Admin routes answer 403 when unset.
    pub admin_token: Option<String>,
}

impl DaemonConfig {
    pub fn liveness_window_ms(&self) -> i64 {
        i64::try_from(self.liveness_window.as_millis()).unwrap_or(i64::MAX)
    }
}
