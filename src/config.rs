use serde::Deserialize;
use std::convert::TryFrom;

/// Configuration for the event loop and the streams it drives.
///
/// It can be initialized from environment variables with the "TEMPEST_"
/// prefix or from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    /// Capacity of the readiness-event buffer handed to each poll.
    /// Defaults to 1024.
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Bytes requested per receive when draining a readable socket.
    /// Defaults to 4kb (4096 bytes).
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Cap on a stream's read buffer; a stream that outgrows it is torn
    /// down. Defaults to 100mb (104,857,600 bytes).
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

/// Implements conversion from the config crate's Config type to LoopConfig.
impl TryFrom<config::Config> for LoopConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl LoopConfig {
    /// Creates a new LoopConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "TEMPEST_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            // Add config file if it exists
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("TEMPEST"));

        // Build and convert into our LoopConfig type
        builder.build()?.try_into()
    }
}

/// Default readiness-event buffer capacity.
fn default_events_capacity() -> usize {
    1024
}

/// Default receive chunk size (4kb).
fn default_read_chunk_size() -> usize {
    4096
}

/// Default read-buffer cap (100mb).
fn default_max_buffer_size() -> usize {
    104_857_600
}

/// Provides default values for all configuration options.
impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: default_events_capacity(),
            read_chunk_size: default_read_chunk_size(),
            max_buffer_size: default_max_buffer_size(),
        }
    }
}
