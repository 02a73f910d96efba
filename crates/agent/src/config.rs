use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub token: String,
    pub poll_interval: Duration,
    pub ssh_timeout: Duration,
    pub request_timeout: Duration,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server_url", &self.server_url)
            .field("token", &"<redacted>")
            .field("poll_interval", &self.poll_interval)
            .field("ssh_timeout", &self.ssh_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
