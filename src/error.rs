use std::io;
use std::path::PathBuf;

use crate::detect::FsType;

/// Every failure the engine reports to its caller.
///
/// None of these are fatal to the process; the presentation layer renders
/// them as messages.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("could not determine the filesystem type of {0}")]
    DetectionInconclusive(PathBuf),

    #[error("failed to mount {fs_type} image: {reason}")]
    MountFailed { fs_type: FsType, reason: String },

    #[error("failed to unpack {fs_type} image: {reason}")]
    UnpackFailed { fs_type: FsType, reason: String },

    #[error("no extraction strategy for {0} images")]
    UnsupportedType(FsType),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file system has not been extracted or mounted")]
    NotMounted,

    #[error("no kernel version string found under {0}")]
    NotFound(PathBuf),

    #[error("required tool `{0}` was not found")]
    ToolUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            ImageError::PermissionDenied(err.to_string())
        } else {
            ImageError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_io_errors_are_distinct() {
        let err: ImageError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, ImageError::PermissionDenied(_)));

        let err: ImageError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, ImageError::Io(_)));
    }

    #[test]
    fn test_messages_name_the_type() {
        let err = ImageError::UnsupportedType(FsType::Jffs2);
        assert_eq!(err.to_string(), "no extraction strategy for JFFS2 images");
    }
}
