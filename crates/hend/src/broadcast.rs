use crate::directory::{Client, ClientDirectory};
use hen_core::{format_notice, Notice};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Fans notices out to directory members, one task per recipient.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    directory: Arc<ClientDirectory>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(directory: Arc<ClientDirectory>, send_timeout: Duration) -> Self {
        Self {
            directory,
            send_timeout,
        }
    }

    /// Sends `notice` to every member not in `exclude` and returns once every
    /// send has finished, failed or timed out. Returns the number delivered.
    pub async fn multicast(&self, notice: &Notice, exclude: &[SocketAddr]) -> usize {
        let line = format_notice(notice);
        let mut sends = JoinSet::new();
        for client in self.directory.snapshot().await {
            if exclude.contains(&client.address) {
                continue;
            }
            let line = line.clone();
            let timeout = self.send_timeout;
            sends.spawn(async move { deliver(&client, line, timeout).await });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(err) => warn!(%err, "fan-out send task failed"),
            }
        }
        debug!(delivered, "multicast complete");
        delivered
    }

    /// Direct send to one client, outside the fan-out.
    pub async fn unicast(&self, client: &Client, notice: &Notice) -> anyhow::Result<()> {
        match tokio::time::timeout(self.send_timeout, client.send(format_notice(notice))).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("send to {} timed out", client.nick),
        }
    }
}

async fn deliver(client: &Client, line: String, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, client.send(line)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(nick = %client.nick, %err, "recipient gone");
            false
        }
        Err(_) => {
            warn!(nick = %client.nick, addr = %client.address, "send timed out, dropping");
            false
        }
    }
}
