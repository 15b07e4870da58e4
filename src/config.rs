/// Process-wide settings resolved from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the relay WebSocket listens on.
    pub bind_addr: String,
    /// SQLite cache location.
    pub database_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            database_path: "karere.db".to_string(),
        }
    }
}
