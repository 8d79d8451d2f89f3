//! One-way file transfer, separate from the relay protocol.
//!
//! The sender writes the file name terminated by `\n`, then the raw file
//! bytes, then shuts down its write half. The receiver keeps only the base
//! name, refuses names with `..` segments, and streams the bytes into a file
//! in its directory until the sender is done.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{info, warn};

/// Longest file name line accepted, terminator included.
pub const MAX_NAME_LEN: u64 = 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("sender closed the connection before naming a file")]
    MissingFileName,
    #[error("file name {0:?} is not allowed")]
    InvalidFileName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reduces a received name to a bare file name.
///
/// Directory parts are stripped; any `..` segment rejects the name outright.
pub fn sanitize_file_name(raw: &str) -> Result<String, TransferError> {
    let name = raw.trim_end_matches(['\r', '\n']);
    let traverses = name.split(['/', '\\']).any(|segment| segment == "..");
    if traverses || name.contains('\0') {
        return Err(TransferError::InvalidFileName(name.to_string()));
    }

    match name.rsplit(['/', '\\']).next() {
        Some(base) if !base.is_empty() && base != "." => Ok(base.to_string()),
        _ => Err(TransferError::InvalidFileName(name.to_string())),
    }
}

/// Sends `path` to a receiver at `server`, returning the bytes sent.
pub async fn send_file(server: SocketAddr, path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let mut file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!(%server, name, "sending file");

    stream.write_all(format!("{name}\n").as_bytes()).await?;
    let sent = tokio::io::copy(&mut file, &mut stream)
        .await
        .context("failed to stream file contents")?;
    stream.shutdown().await?;

    info!(%server, name, bytes = sent, "file sent");
    Ok(sent)
}

/// Reads one named file from `stream` into `dir`.
pub async fn receive_file<S>(stream: S, dir: &Path) -> Result<(PathBuf, u64), TransferError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);

    let mut name = String::new();
    if (&mut reader).take(MAX_NAME_LEN).read_line(&mut name).await? == 0 {
        return Err(TransferError::MissingFileName);
    }
    if !name.ends_with('\n') {
        return Err(TransferError::InvalidFileName(name));
    }

    let path = dir.join(sanitize_file_name(&name)?);
    let mut file = File::create(&path).await?;
    let received = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;

    Ok((path, received))
}

/// Accepts file uploads into one directory.
pub struct FileReceiver {
    listener: TcpListener,
    dir: Arc<PathBuf>,
}

impl FileReceiver {
    pub async fn bind(listen: SocketAddr, dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        Ok(Self {
            listener,
            dir: Arc::new(dir),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts uploads until `shutdown` resolves, then waits for the ones in
    /// flight to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let FileReceiver { listener, dir } = self;
        let mut uploads = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dir = Arc::clone(&dir);
                        uploads.spawn(async move {
                            match receive_file(stream, &dir).await {
                                Ok((path, bytes)) => {
                                    info!(%peer, path = %path.display(), bytes, "file received");
                                }
                                Err(error) => warn!(%peer, %error, "file transfer failed"),
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept upload"),
                },
                Some(_) = uploads.join_next() => {}
            }
        }

        drop(listener);
        while uploads.join_next().await.is_some() {}
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
