use std::env;
use std::net::IpAddr;

use chrono::Utc;

use crate::defaults::DEFAULT_KEY;

/// Who is on the other end of this SSH connection.
///
/// Built once at connection start from the environment the SSH daemon and
/// the forced command supply; immutable for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Short opaque user tag from authorized_keys (`KEY=...`). The primary
    /// ACL principal.
    pub key: String,
    pub client_ip: Option<String>,
    pub client_port: Option<String>,
    pub server_ip: Option<String>,
    pub server_port: Option<String>,
    /// Epoch seconds at which this identity was constructed.
    pub connected_epoch: i64,
}

impl Identity {
    pub fn from_env() -> Self {
        let key = env::var("KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_KEY.to_string());
        let conn = ssh_context();
        let mut fields = conn.as_deref().unwrap_or("").split_whitespace();
        Identity {
            key,
            client_ip: fields.next().map(String::from),
            client_port: fields.next().map(String::from),
            server_ip: fields.next().map(String::from),
            server_port: fields.next().map(String::from),
            connected_epoch: Utc::now().timestamp(),
        }
    }

    /// The client IP as an address, when the SSH daemon provided one.
    pub fn client_addr(&self) -> Option<IpAddr> {
        self.client_ip.as_deref()?.parse().ok()
    }

    pub fn has_ssh_context(&self) -> bool {
        self.client_ip.is_some()
    }
}

/// `SSH_CLIENT` is the canonical source; `SSH_CONNECTION` carries the same
/// leading fields and serves as the alternate.
pub fn ssh_context() -> Option<String> {
    env::var("SSH_CLIENT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            env::var("SSH_CONNECTION")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}
