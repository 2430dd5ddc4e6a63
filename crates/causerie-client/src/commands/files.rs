use std::path::{Path, PathBuf};

use tracing::{debug, info};

use causerie_net::SessionManager;
use causerie_shared::{AppDestination, ChatEnvelope, FilePayload, UserId};

use crate::commands::messaging::check_receiver;
use crate::error::ClientError;
use crate::router::MessageRouter;

/// Read a file for sending. Oversized files are refused from their
/// metadata, before any of the content is read.
pub async fn read_attachment(path: &Path) -> Result<FilePayload, ClientError> {
    let meta = tokio::fs::metadata(path).await?;
    FilePayload::check_size(meta.len())?;

    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    debug!(name = %name, mime = %mime, size = bytes.len(), "Attachment read");
    Ok(FilePayload::from_bytes(name, mime.essence_str(), &bytes)?)
}

pub async fn send_file(
    transport: &SessionManager,
    router: &MessageRouter,
    path: &Path,
    caption: &str,
    receiver: Option<UserId>,
) -> Result<ChatEnvelope, ClientError> {
    check_receiver(router, receiver.as_ref())?;
    let file = read_attachment(path).await?;
    let envelope = router.compose_file(file, caption.trim(), receiver)?;
    transport
        .publish(AppDestination::SendFile, envelope.to_json()?)
        .await?;
    info!(envelope = %envelope, "File sent");
    Ok(envelope)
}

/// Write a received attachment into `dir`. Only the final component of
/// the sender-supplied name is used.
pub async fn save_attachment(file: &FilePayload, dir: &Path) -> Result<PathBuf, ClientError> {
    let bytes = file.decode()?;
    let name = Path::new(&file.name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    let target = dir.join(name);
    tokio::fs::write(&target, bytes).await?;
    info!(path = %target.display(), "Attachment saved");
    Ok(target)
}
