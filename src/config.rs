//! Configuration shared by a session and its protocol client.
//!
//! Values can be loaded from the standard `EPICS_CA_*` environment variables
//! with [`Config::from_env`], then adjusted builder-style.

use std::{env, fmt, time::Duration};

use tracing::{debug, warn};

/// Default `EPICS_CA_MAX_ARRAY_BYTES`
pub const DEFAULT_MAX_ARRAY_BYTES: usize = 33_554_532;
/// Smallest accepted `EPICS_CA_MAX_ARRAY_BYTES`
pub const MIN_MAX_ARRAY_BYTES: usize = 128;
/// Default timeout for one-shot operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    use_env: bool,
    auto_addr_list: bool,
    addr_list: Vec<String>,
    name_servers: Vec<String>,
    max_array_bytes: usize,
    timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            use_env: false,
            auto_addr_list: true,
            addr_list: Vec::new(),
            name_servers: Vec::new(),
            max_array_bytes: DEFAULT_MAX_ARRAY_BYTES,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the `EPICS_CA_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config {
            use_env: true,
            ..Default::default()
        };
        config.auto_addr_list = lookup("EPICS_CA_AUTO_ADDR_LIST")
            .map(|v| !v.trim().eq_ignore_ascii_case("no"))
            .unwrap_or(true);
        config.addr_list = lookup("EPICS_CA_ADDR_LIST")
            .map(|v| v.split_ascii_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        config.name_servers = lookup("EPICS_CA_NAME_SERVERS")
            .map(|v| v.split_ascii_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        if let Some(raw) = lookup("EPICS_CA_MAX_ARRAY_BYTES") {
            match raw.trim().parse::<usize>() {
                Ok(bytes) => config = config.max_array_bytes(bytes),
                Err(e) => warn!("Ignoring EPICS_CA_MAX_ARRAY_BYTES='{raw}': {e}"),
            }
        }
        debug!("Loaded configuration from environment: {config:?}");
        config
    }

    /// Whether values were taken from the process environment
    pub fn use_env(&self) -> bool {
        self.use_env
    }

    pub fn get_auto_addr_list(&self) -> bool {
        self.auto_addr_list
    }

    pub fn get_addr_list(&self) -> &[String] {
        &self.addr_list
    }

    pub fn get_name_servers(&self) -> &[String] {
        &self.name_servers
    }

    pub fn get_max_array_bytes(&self) -> usize {
        self.max_array_bytes
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn auto_addr_list(mut self, auto: bool) -> Self {
        self.auto_addr_list = auto;
        self
    }

    pub fn addr_list<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addr_list = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn name_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.name_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the largest array payload. Values below 128 bytes are ignored.
    pub fn max_array_bytes(mut self, bytes: usize) -> Self {
        if bytes < MIN_MAX_ARRAY_BYTES {
            warn!(
                "Ignoring max_array_bytes={bytes}, must be at least {MIN_MAX_ARRAY_BYTES}; keeping {}",
                self.max_array_bytes
            );
        } else {
            self.max_array_bytes = bytes;
        }
        self
    }

    /// Default timeout for one-shot operations. Zero is ignored.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            warn!("Ignoring zero timeout, keeping {:?}", self.timeout);
        } else {
            self.timeout = timeout;
        }
        self
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(items: &[String]) -> String {
            if items.is_empty() {
                "(empty)".to_string()
            } else {
                items.join(" ")
            }
        }
        writeln!(f, "use_env:          {}", self.use_env)?;
        writeln!(
            f,
            "auto_addr_list:   {}",
            if self.auto_addr_list { "YES" } else { "NO" }
        )?;
        writeln!(f, "addr_list:        {}", list(&self.addr_list))?;
        writeln!(f, "name_servers:     {}", list(&self.name_servers))?;
        writeln!(f, "max_array_bytes:  {}", self.max_array_bytes)?;
        write!(f, "timeout:          {:.3} s", self.timeout.as_secs_f64())
    }
}
