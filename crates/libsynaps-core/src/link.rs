//! Byte link to a serially attached device
//!
//! The physical line settings (baud rate, parity) are configured outside the
//! daemon; adapters only need line and fixed-size frame reads with timeouts.

use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::AdapterError;

#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Port or URL the link is attached to
    fn port(&self) -> &str;

    async fn write_all(&self, data: &[u8]) -> Result<(), AdapterError>;

    /// Next line without its terminator; `None` on timeout or end of stream
    async fn read_line(&self, timeout: Duration) -> Result<Option<String>, AdapterError>;

    /// Exactly `n` bytes; `None` on timeout or end of stream
    async fn read_exact(&self, n: usize, timeout: Duration)
        -> Result<Option<Vec<u8>>, AdapterError>;

    /// Drop buffered input
    async fn clear_buffer(&self) -> Result<(), AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;
}

struct SerialIo {
    reader: BufReader<File>,
    writer: File,
}

/// Link over a character device such as `/dev/ttyAMA0`
pub struct SerialLink {
    port: String,
    io: Mutex<Option<SerialIo>>,
}

impl SerialLink {
    pub async fn open(port: &str) -> Result<Self, AdapterError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(port)
            .await
            .map_err(|e| AdapterError::Link(format!("cannot open {}: {}", port, e)))?;
        let writer = file.try_clone().await?;

        Ok(Self {
            port: port.to_string(),
            io: Mutex::new(Some(SerialIo {
                reader: BufReader::new(file),
                writer,
            })),
        })
    }

    fn closed(&self) -> AdapterError {
        AdapterError::Closed(self.port.clone())
    }
}

#[async_trait]
impl SensorLink for SerialLink {
    fn port(&self) -> &str {
        &self.port
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), AdapterError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(|| self.closed())?;
        io.writer.write_all(data).await?;
        io.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&self, timeout: Duration) -> Result<Option<String>, AdapterError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(|| self.closed())?;

        let mut line = String::new();
        match tokio::time::timeout(timeout, io.reader.read_line(&mut line)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn read_exact(
        &self,
        n: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, AdapterError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(|| self.closed())?;

        let mut buf = vec![0u8; n];
        match tokio::time::timeout(timeout, io.reader.read_exact(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(buf)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn clear_buffer(&self) -> Result<(), AdapterError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(|| self.closed())?;
        let buffered = io.reader.buffer().len();
        io.reader.consume(buffered);
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.io.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_lines_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tty");
        std::fs::write(&path, "$JYBSS,1, , , *\r\nDone\r\n").unwrap();

        let link = SerialLink::open(path.to_str().unwrap()).await.unwrap();
        let t = Duration::from_millis(200);
        assert_eq!(link.read_line(t).await.unwrap().as_deref(), Some("$JYBSS,1, , , *"));
        assert_eq!(link.read_line(t).await.unwrap().as_deref(), Some("Done"));
        assert_eq!(link.read_line(t).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tty");
        std::fs::write(&path, "").unwrap();

        let link = SerialLink::open(path.to_str().unwrap()).await.unwrap();
        link.close().await.unwrap();
        assert!(matches!(
            link.write_all(b"sensorStart\r\n").await,
            Err(AdapterError::Closed(_))
        ));
    }
}
