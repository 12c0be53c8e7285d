use clap::Parser;

use crate::relay::RelayConfig;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay newline-delimited chat between TCP clients",
    long_about = None
)]
pub struct Cli {
    /// TCP port to listen on. Use 0 for an ephemeral port.
    pub port: Option<u16>,
}

impl Cli {
    /// Relay settings for the given port; `None` when no port was supplied.
    pub fn relay_config(&self) -> Option<RelayConfig> {
        self.port.map(RelayConfig::with_port)
    }
}
