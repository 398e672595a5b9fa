use tokio::io::AsyncWriteExt as _;

/// Queue of finished build logs, compressed to zstd by a dedicated task.
/// Best-effort: a log that fails to compress is left as-is.
pub struct LogCompressor {
    tx: tokio::sync::mpsc::UnboundedSender<std::path::PathBuf>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<std::path::PathBuf>>,
}

impl Default for LogCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl LogCompressor {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<std::path::PathBuf>();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn enqueue(&self, log_path: impl Into<std::path::PathBuf>) {
        let log_path = log_path.into();
        if self.tx.send(log_path.clone()).is_err() {
            tracing::error!("log compressor channel closed, leaving {log_path:?} uncompressed");
        }
    }

    /// Compress one queued log; awaits until an item is available.
    pub async fn compress_once(&self) -> anyhow::Result<()> {
        let path = {
            let mut rx = self.rx.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("log compressor channel closed"))?
        };
        compress_log(&path).await
    }
}

#[tracing::instrument(err)]
async fn compress_log(path: &std::path::Path) -> anyhow::Result<()> {
    let source = fs_err::tokio::File::open(path).await?;
    let mut encoder =
        async_compression::tokio::bufread::ZstdEncoder::new(tokio::io::BufReader::new(source));

    let mut target_path = path.as_os_str().to_owned();
    target_path.push(".zst");
    let mut target = fs_err::tokio::File::create(&target_path).await?;
    tokio::io::copy(&mut encoder, &mut target).await?;
    target.flush().await?;

    fs_err::tokio::remove_file(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compress_replaces_log_with_zst() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        fs_err::tokio::write(&log, b"hello build log\n".repeat(100))
            .await
            .unwrap();

        let compressor = LogCompressor::new();
        compressor.enqueue(&log);
        compressor.compress_once().await.unwrap();

        assert!(!log.exists());
        let compressed = dir.path().join("build.log.zst");
        assert!(compressed.exists());
        assert!(fs_err::metadata(&compressed).unwrap().len() > 0);
    }
}
