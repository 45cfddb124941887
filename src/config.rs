use serde::Deserialize;
use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tracing::info;

/// Largest extranonce the bridge hands out. Kaspa-style 8 byte nonces leave the miner at least
/// five bytes to roll.
pub const MAX_EXTRANONCE_SIZE: u8 = 3;

/// Size in bytes of the nonce submitted by miners.
pub const NONCE_SIZE: usize = 8;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidListenAddress(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Unable to read config file: `{:?}`", e),
            ConfigError::Parse(e) => write!(f, "Unable to parse config file: `{}`", e),
            ConfigError::InvalidListenAddress(a) => write!(f, "Invalid listen address: `{}`", a),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// How session difficulty is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyMode {
    /// Per session control loop targeting `shares_per_min`.
    VarDiff,
    /// Every session mines at the network difficulty of the current job.
    Network,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the stratum listener binds to. `:5555` binds on every interface.
    pub listen_address: String,
    pub min_share_diff: f64,
    pub var_diff: bool,
    pub shares_per_min: u32,
    /// Accepted relative deviation from `shares_per_min` before vardiff retargets.
    pub var_diff_tolerance: f64,
    pub var_diff_stats: bool,
    pub pow2_clamp: bool,
    pub solo_mining: bool,
    pub extranonce_size: u8,
    #[serde(deserialize_with = "duration_from_json")]
    pub block_wait_time: Duration,
    #[serde(deserialize_with = "duration_from_json")]
    pub idle_timeout: Duration,
    /// Accept `mining.authorize` from miners that never sent `mining.subscribe`.
    pub subscribe_optional: bool,
    /// Number of recent jobs shares may still reference.
    pub job_window: usize,
    pub print_stats: bool,
    pub payout_address: String,
    pub client_tag: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_address: ":5555".to_string(),
            min_share_diff: 4.0,
            var_diff: true,
            shares_per_min: 20,
            var_diff_tolerance: 0.2,
            var_diff_stats: false,
            pow2_clamp: false,
            solo_mining: false,
            extranonce_size: 0,
            block_wait_time: Duration::from_millis(1000),
            idle_timeout: Duration::from_secs(300),
            subscribe_optional: true,
            job_window: 8,
            print_stats: true,
            payout_address: String::new(),
            client_tag: format!("stratum-bridge_{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl BridgeConfig {
    /// Reads the optional JSON config file, applies environment overrides and validates the
    /// result.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!("Loading config @ `{}`", path);
                let raw = std::fs::read_to_string(path)?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        if let Ok(addr) = std::env::var("STRATUM_LISTEN_ADDR") {
            config.listen_address = addr;
        }
        if let Ok(address) = std::env::var("PAYOUT_ADDRESS") {
            config.payout_address = address;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extranonce_size > MAX_EXTRANONCE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "extranonce_size {} exceeds maximum of {}",
                self.extranonce_size, MAX_EXTRANONCE_SIZE
            )));
        }
        if !(self.min_share_diff > 0.0) || !self.min_share_diff.is_finite() {
            return Err(ConfigError::Invalid(
                "min_share_diff must be a positive number".to_string(),
            ));
        }
        if self.shares_per_min == 0 {
            return Err(ConfigError::Invalid(
                "shares_per_min must be greater than zero".to_string(),
            ));
        }
        if self.job_window == 0 {
            return Err(ConfigError::Invalid(
                "job_window must retain at least one job".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.var_diff_tolerance) {
            return Err(ConfigError::Invalid(
                "var_diff_tolerance must be in [0, 1)".to_string(),
            ));
        }
        self.listen_socket_addr()?;
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        addr.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidListenAddress(self.listen_address.clone()))
    }

    pub fn difficulty_mode(&self) -> DifficultyMode {
        if self.solo_mining || !self.var_diff {
            DifficultyMode::Network
        } else {
            DifficultyMode::VarDiff
        }
    }

    pub fn log_summary(&self) {
        info!("----------------------------------");
        info!("initializing bridge");
        info!("\tstratum:         {}", self.listen_address);
        info!("\tstats:           {}", self.print_stats);
        info!("\tmin diff:        {:.10}", self.min_share_diff);
        info!("\tvar diff:        {}", self.var_diff);
        info!("\tshares per min:  {}", self.shares_per_min);
        info!("\tvar diff stats:  {}", self.var_diff_stats);
        info!("\tpow2 clamp:      {}", self.pow2_clamp);
        info!("\tsolo mining:     {}", self.solo_mining);
        info!("\tblock wait:      {:?}", self.block_wait_time);
        info!("\textranonce size: {}", self.extranonce_size);
        info!("\tidle timeout:    {:?}", self.idle_timeout);
        info!("\tjob window:      {}", self.job_window);
        info!("----------------------------------");
    }
}

fn duration_from_json<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Helper {
        unit: String,
        value: u64,
    }

    let helper = Helper::deserialize(deserializer)?;
    match helper.unit.as_str() {
        "seconds" | "secs" | "s" => Ok(Duration::from_secs(helper.value)),
        "milliseconds" | "millis" | "ms" => Ok(Duration::from_millis(helper.value)),
        "microseconds" | "micros" | "us" => Ok(Duration::from_micros(helper.value)),
        "minutes" | "mins" | "m" => helper
            .value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| serde::de::Error::custom("Duration out of range")),
        _ => Err(serde::de::Error::custom("Unsupported duration unit")),
    }
}
