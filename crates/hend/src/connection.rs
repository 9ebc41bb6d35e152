use hen_core::{clean_line, format_notice, Notice};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a closing connection may spend flushing queued output.
pub const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Line(String),
    Closed,
    Idle,
}

/// Line reader plus the sending side of the connection's outbound queue.
///
/// Input is read as raw bytes; bytes that are not UTF-8 are replaced rather
/// than treated as a broken connection.
pub struct Connection<R> {
    pub address: SocketAddr,
    reader: BufReader<R>,
    // Survives a cancelled read so a partial line is never lost.
    pending: Vec<u8>,
    tx: mpsc::Sender<String>,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    /// Spawns the writer task that owns `writer`; every byte sent to this
    /// client goes through it.
    pub fn open<W>(
        reader: R,
        writer: W,
        address: SocketAddr,
        queue: usize,
    ) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(queue.max(1));
        let writer_task = tokio::spawn(write_loop(writer, rx, address));
        let conn = Self {
            address,
            reader: BufReader::new(reader),
            pending: Vec::new(),
            tx,
        };
        (conn, writer_task)
    }

    pub fn outbound(&self) -> mpsc::Sender<String> {
        self.tx.clone()
    }

    pub async fn send(&self, notice: &Notice) -> anyhow::Result<()> {
        self.tx
            .send(format_notice(notice))
            .await
            .map_err(|_| anyhow::anyhow!("writer for {} closed", self.address))
    }

    /// Next line without its terminator. Read errors count as a close.
    pub async fn next_line(&mut self, idle: Option<Duration>) -> Inbound {
        let read = match idle {
            Some(limit) => match tokio::time::timeout(limit, self.read_raw_line()).await {
                Ok(read) => read,
                Err(_) => return Inbound::Idle,
            },
            None => self.read_raw_line().await,
        };
        match read {
            Ok(true) => {
                let raw = std::mem::take(&mut self.pending);
                let line = String::from_utf8_lossy(&raw);
                Inbound::Line(clean_line(&line).to_string())
            }
            Ok(false) => Inbound::Closed,
            Err(err) => {
                warn!(addr = %self.address, %err, "read error");
                Inbound::Closed
            }
        }
    }

    /// Fills `pending` up to and including the next `\n`. `false` at end of
    /// stream with nothing buffered.
    async fn read_raw_line(&mut self) -> std::io::Result<bool> {
        loop {
            if self.pending.last() == Some(&b'\n') {
                return Ok(true);
            }
            let n = self.reader.read_until(b'\n', &mut self.pending).await?;
            if n == 0 {
                return Ok(!self.pending.is_empty());
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<String>, address: SocketAddr)
where
    W: AsyncWrite + Unpin,
{
    while let Some(text) = rx.recv().await {
        if let Err(err) = writer.write_all(text.as_bytes()).await {
            debug!(addr = %address, %err, "write failed");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Waits briefly for the writer to drain, then stops it.
pub async fn close_writer(mut writer_task: JoinHandle<()>) {
    if tokio::time::timeout(FLUSH_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
}
