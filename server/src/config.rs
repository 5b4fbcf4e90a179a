use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_MAX_SESSIONS: u16 = 256;
pub const DEFAULT_PORT_LOW: u16 = 20000;

#[derive(Serialize, Deserialize)]
pub struct Server {
    /// Hostname announced to clients in the data-plane URL.
    pub hostname: String,
    /// Address the stream listener binds to.
    pub address: String,
    pub port: u16,
    pub max_sessions: u16,
    /// First port of the data-plane pool; the pool spans one port per
    /// session slot.
    pub port_low: u16,
    pub max_connection_attempts: u16,
}

#[derive(Serialize, Deserialize)]
pub struct Data {
    pub fps: f32,
    pub mtu: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Auth {
    /// JSON file of user records.
    pub users_file: String,
    /// Data exchange definition announced to clients.
    pub ded: String,
}

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: Server,
    pub data: Data,
    pub auth: Auth,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server: Server {
                hostname: "localhost".to_owned(),
                address: "0.0.0.0".to_owned(),
                port: DEFAULT_PORT,
                max_sessions: DEFAULT_MAX_SESSIONS,
                port_low: DEFAULT_PORT_LOW,
                max_connection_attempts: 10,
            },
            data: Data {
                fps: 60.0,
                mtu: verse::DEFAULT_MTU,
            },
            auth: Auth {
                users_file: "users.json".to_owned(),
                ded: "verse-ded-v1".to_owned(),
            },
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    /// End of the data-plane port range, one port per session slot.
    pub fn port_high(&self) -> u16 {
        self.server.port_low + self.server.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.port_high(), DEFAULT_PORT_LOW + DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn test_parse_toml() {
        let config: ServerConfig = serdeconv::from_toml_str(
            r#"
[server]
hostname = "verse.example"
address = "0.0.0.0"
port = 5544
max_sessions = 8
port_low = 21000
max_connection_attempts = 5

[data]
fps = 30.0
mtu = 1200

[auth]
users_file = "/etc/verse/users.json"
ded = "custom-ded"
"#,
        )
        .unwrap();

        assert_eq!(config.server.hostname, "verse.example");
        assert_eq!(config.server.port, 5544);
        assert_eq!(config.data.fps, 30.0);
        assert_eq!(config.auth.ded, "custom-ded");
        assert_eq!(config.port_high(), 21008);
    }
}
