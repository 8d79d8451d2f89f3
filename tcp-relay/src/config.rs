use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{cli::ServeArgs, connection::ConnectionOptions, frame::DEFAULT_MAX_FRAME_LEN};

pub const DEFAULT_PORT: u16 = 65432;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one relay server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to listen on. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Largest payload accepted from or sent to a client.
    pub max_frame_len: usize,
    /// Upper bound on a single send; `None` waits forever.
    pub write_timeout: Option<Duration>,
    /// Disconnect clients that send nothing for this long; `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            idle_timeout: None,
        }
    }
}

impl RelayConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_len: self.max_frame_len,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl From<&ServeArgs> for RelayConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            listen: args.listen,
            max_frame_len: args.max_frame_bytes,
            // 0 disables the bound
            write_timeout: (args.write_timeout_ms > 0)
                .then(|| Duration::from_millis(args.write_timeout_ms)),
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}
