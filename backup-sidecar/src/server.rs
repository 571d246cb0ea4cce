//! Sidecar listener: one task per connection, one archive per request.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use backup_core::digest::same_digest;
use backup_wire::{BackupReply, BackupRequest, FrameTransport, MAX_FRAME_LEN};

use crate::archive;
use crate::config::SidecarConfig;
use crate::error::{io_err, SidecarError};

/// Start the sidecar and block the current thread until ctrl-c.
pub fn start_blocking(config: SidecarConfig) -> Result<(), SidecarError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

pub async fn run(config: SidecarConfig) -> Result<(), SidecarError> {
    let listener = backup_wire::bind_listener(config.bind, config.listen_backlog)?;
    run_until(listener, config.scratch_dir, async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|err| SidecarError::Runtime(format!("ctrl-c handler failed: {err}")))
    })
    .await
}

/// Serve connections on `listener` until `stop` resolves. In-flight
/// transfers are cancelled on the way out.
pub async fn run_until<F>(
    listener: TcpListener,
    scratch_dir: PathBuf,
    stop: F,
) -> Result<(), SidecarError>
where
    F: Future<Output = Result<(), SidecarError>>,
{
    std::fs::create_dir_all(&scratch_dir).map_err(|e| io_err(&scratch_dir, e))?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, scratch_dir = %scratch_dir.display(), "sidecar listening");
    }

    tokio::pin!(stop);
    let mut backup_no: u64 = 0;
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            stopped = &mut stop => break stopped,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "sidecar accept failed");
                        continue;
                    }
                };
                let scratch = scratch_path(&scratch_dir, backup_no);
                backup_no += 1;
                tracing::info!(%peer, "accepted backup connection");
                connections.spawn(async move {
                    match handle_connection(stream, scratch).await {
                        Ok(reply) => tracing::info!(%peer, %reply, "backup request served"),
                        Err(err) => tracing::warn!(%peer, error = %err, "backup request failed"),
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    connections.shutdown().await;
    tracing::info!("sidecar stopped");
    result
}

fn scratch_path(dir: &Path, backup_no: u64) -> PathBuf {
    dir.join(format!("backup-sidecar-{}-{backup_no}.tar.gz", std::process::id()))
}

/// Removes the scratch archive however the connection ends.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.0.display(), error = %err, "failed to remove scratch archive");
            }
        }
    }
}

/// Answer one backup request, archiving into `scratch`.
///
/// A request that cannot be read or parsed is dropped without a reply.
pub async fn handle_connection<S>(stream: S, scratch: PathBuf) -> Result<BackupReply, SidecarError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _scratch = ScratchFile(scratch.clone());
    let mut transport = FrameTransport::new(stream);

    let text = transport.receive_text().await?;
    let request: BackupRequest = serde_json::from_str(&text)?;
    tracing::debug!(path = %request.path, previous = %request.checksum, "backup requested");

    let source = PathBuf::from(&request.path);
    let built = tokio::task::spawn_blocking(move || archive::build(&source, &scratch)).await?;
    let archive = match built {
        Ok(archive) => archive,
        Err(err) => {
            tracing::warn!(path = %request.path, error = %err, "cannot archive requested path");
            return reply_only(transport, BackupReply::Abort).await;
        }
    };

    if !request.checksum.is_empty() && same_digest(&request.checksum, &archive.checksum) {
        tracing::info!(path = %request.path, "content unchanged, skipping transfer");
        return reply_only(transport, BackupReply::Same).await;
    }
    if archive.size > MAX_FRAME_LEN {
        tracing::warn!(
            path = %request.path,
            size = archive.size,
            limit = MAX_FRAME_LEN,
            "archive too large for one frame",
        );
        return reply_only(transport, BackupReply::Abort).await;
    }

    transport.send_text(BackupReply::Diff.as_str()).await?;
    let sent = transport.send_file(&archive.path).await?;
    transport.send_text(&archive.checksum).await?;
    transport.close().await?;
    tracing::debug!(path = %request.path, bytes = sent, "archive sent");
    Ok(BackupReply::Diff)
}

async fn reply_only<S>(
    mut transport: FrameTransport<S>,
    reply: BackupReply,
) -> Result<BackupReply, SidecarError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send_text(reply.as_str()).await?;
    transport.close().await?;
    Ok(reply)
}
