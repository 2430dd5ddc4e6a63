//! User commands accepted by the client controller.
//!
//! Each sub-module groups the handlers for one domain.

pub mod files;
pub mod media;
pub mod messaging;
pub mod profile;

use std::path::PathBuf;

use causerie_shared::UserId;

pub use media::CallCommand;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Send a chat line, publicly or to one user.
    SendMessage { content: String, to: Option<UserId> },
    /// Send a file read from disk.
    SendFile {
        path: PathBuf,
        caption: String,
        to: Option<UserId>,
    },
    /// Attach an image to everything sent from now on.
    SetProfileImage(PathBuf),
    Call(CallCommand),
    /// Announce departure and stop the client.
    Leave,
}
