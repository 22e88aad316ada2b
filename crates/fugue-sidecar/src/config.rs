//! Sidecar process configuration.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::backoff::Backoff;
use crate::error::SidecarError;

/// Invocation protocol spoken by the colocated function container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Http,
    Grpc,
}

#[derive(Debug, Parser)]
#[command(name = "fugue-sidecar", about = "Per-replica function dispatch loop")]
pub struct Config {
    /// Broker server(s) to connect to.
    #[arg(long, value_delimiter = ',', default_value = "localhost:4222")]
    pub brokers: Vec<String>,

    /// Topic(s) to listen to as input for the function.
    /// Only a single input is supported for now.
    #[arg(long, value_delimiter = ',')]
    pub inputs: Vec<String>,

    /// Topic(s) to write function results to.
    /// Only a single output is supported for now.
    #[arg(long, value_delimiter = ',')]
    pub outputs: Vec<String>,

    /// Consumer group to act as; identifies the function.
    #[arg(long)]
    pub group: String,

    /// Dispatcher protocol to use.
    #[arg(long, value_enum)]
    pub protocol: Protocol,

    /// Local port the function container listens on.
    #[arg(long)]
    pub port: u16,

    /// Time to wait (ms) for the function container to initialize.
    #[arg(long, default_value = "0")]
    pub initial_delay_ms: u64,

    /// Exit when the function closes its output stream instead of retrying.
    #[arg(long)]
    pub exit_on_complete: bool,

    /// Maximum number of times to retry connecting to the function.
    #[arg(long, default_value = "3")]
    pub max_backoff_retries: u32,

    /// Wait time increase factor for each retry.
    #[arg(long, default_value = "2")]
    pub backoff_multiplier: u32,

    /// Base wait time (ms) before a retry.
    #[arg(long, default_value = "1000")]
    pub backoff_duration_ms: u64,
}

impl Config {
    /// The single input topic. More than one is rejected rather than
    /// silently dropped.
    pub fn input(&self) -> Result<&str, SidecarError> {
        match self.inputs.as_slice() {
            [input] => Ok(input),
            [] => Err(SidecarError::Config("an input topic is required".into())),
            more => Err(SidecarError::Config(format!(
                "only 1 input is supported for now, got {}",
                more.len()
            ))),
        }
    }

    /// The optional output topic.
    pub fn output(&self) -> Result<Option<&str>, SidecarError> {
        match self.outputs.as_slice() {
            [] => Ok(None),
            [output] => Ok(Some(output)),
            more => Err(SidecarError::Config(format!(
                "only 1 output is supported for now, got {}",
                more.len()
            ))),
        }
    }

    pub fn initial_delay(&self) -> Option<Duration> {
        (self.initial_delay_ms > 0).then(|| Duration::from_millis(self.initial_delay_ms))
    }

    pub fn backoff(&self) -> Result<Backoff, SidecarError> {
        Backoff::new(
            Duration::from_millis(self.backoff_duration_ms),
            self.max_backoff_retries,
            self.backoff_multiplier,
        )
    }

    /// Per-call timeout for the gRPC dispatcher.
    ///
    /// With `exit_on_complete` there is no retry loop to fall back on, so
    /// the call blocks for a long time instead. Otherwise fail fast while
    /// the function warms up, stretched to the configured startup delay
    /// when one is set so the first real call's timeout matches the
    /// expected boot time.
    pub fn call_timeout(&self) -> Duration {
        const DEFAULT: Duration = Duration::from_millis(100);
        const EXIT_ON_COMPLETE: Duration = Duration::from_secs(60);

        if self.exit_on_complete {
            return EXIT_ON_COMPLETE;
        }
        self.initial_delay().unwrap_or(DEFAULT)
    }
}
