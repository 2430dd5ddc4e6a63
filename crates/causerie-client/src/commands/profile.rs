use std::path::Path;

use mime_guess::mime;
use tracing::info;

use causerie_shared::constants::MAX_PROFILE_IMAGE_SIZE;
use causerie_shared::{ProfileRef, ProtocolError};

use crate::error::ClientError;

/// Load an image file as a profile picture.
pub async fn load_profile_image(path: &Path) -> Result<ProfileRef, ClientError> {
    let mime = mime_guess::from_path(path)
        .first()
        .filter(|m| m.type_() == mime::IMAGE)
        .ok_or_else(|| ClientError::NotAnImage(path.display().to_string()))?;

    let size = tokio::fs::metadata(path).await?.len();
    if size > MAX_PROFILE_IMAGE_SIZE as u64 {
        return Err(ProtocolError::ProfileImageTooLarge {
            size: size as usize,
            max: MAX_PROFILE_IMAGE_SIZE,
        }
        .into());
    }

    let bytes = tokio::fs::read(path).await?;
    let profile = ProfileRef::from_image(mime.essence_str(), &bytes)?;
    info!(path = %path.display(), size, "Profile image loaded");
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_profile_image_becomes_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("me.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let profile = load_profile_image(&path).await.unwrap();
        assert_eq!(profile.as_str(), "data:image/png;base64,iVBORw==");
    }

    #[tokio::test]
    async fn test_non_image_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("me.txt");
        std::fs::write(&path, b"hi").unwrap();
        assert!(matches!(
            load_profile_image(&path).await,
            Err(ClientError::NotAnImage(_))
        ));
    }

    #[tokio::test]
    async fn test_large_image_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        std::fs::write(&path, vec![0u8; MAX_PROFILE_IMAGE_SIZE + 1]).unwrap();
        assert!(matches!(
            load_profile_image(&path).await,
            Err(ClientError::Protocol(ProtocolError::ProfileImageTooLarge { .. }))
        ));
    }
}
