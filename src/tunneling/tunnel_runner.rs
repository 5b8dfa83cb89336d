use russh::{Channel, client};
use tokio::net::TcpStream;

use super::transport::TransportError;

/// Pipes one forwarded connection from the relay to the local service.
pub(super) struct TunnelRunner {
    to_addr: String,
    to_port: u16,
}

impl TunnelRunner {
    pub fn new(to_addr: &str, to_port: u16) -> Self {
        TunnelRunner {
            to_addr: to_addr.to_string(),
            to_port,
        }
    }
    pub fn addr(&self) -> &str {
        &self.to_addr
    }
    pub fn port(&self) -> u16 {
        self.to_port
    }
    /// Returns the bytes copied relay→local and local→relay.
    pub async fn run(&mut self, channel: Channel<client::Msg>) -> Result<(u64, u64), TransportError> {
        let mut local = TcpStream::connect((self.to_addr.as_str(), self.to_port)).await?;
        let remote = channel.into_stream();
        tokio::pin!(remote);
        Ok(tokio::io::copy_bidirectional(&mut remote, &mut local).await?)
    }
}
