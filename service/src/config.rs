use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use gateway::Settings;
use log::LevelFilter;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface to listen for incoming gateway connections
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub interface: IpAddr,

    /// The host TCP port to listen for incoming gateway connections
    #[arg(short, long, env, default_value_t = gateway::server::DEFAULT_PORT)]
    pub port: u16,

    /// Size in bytes of the buffer each socket read goes through
    #[arg(long, env, default_value_t = gateway::server::DEFAULT_READ_BUFFER_SIZE)]
    pub read_buffer_size: usize,

    /// Longest inbound line in bytes; longer lines are discarded
    #[arg(long, env, default_value_t = gateway::server::DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Milliseconds to wait for the reactor thread when shutting down
    #[arg(long, env, default_value_t = 1000)]
    pub shutdown_timeout_ms: u64,

    /// Upstream server-sent-event stream of announcements to mirror to
    /// gateway clients (e.g. http://localhost:8080/api/announcements/stream).
    /// The mirror is disabled when unset.
    #[arg(long, env)]
    sse_url: Option<String>,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Returns the upstream SSE URL, ignoring a blank value.
    pub fn sse_url(&self) -> Option<&str> {
        self.sse_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The subset of configuration the gateway itself consumes.
    pub fn gateway_settings(&self) -> Settings {
        Settings {
            addr: self.listen_addr(),
            read_buffer_size: self.read_buffer_size,
            max_frame_len: self.max_frame_len,
            shutdown_timeout: self.shutdown_timeout(),
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        config.gateway_settings()
    }
}
