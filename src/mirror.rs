//! Image transform for mirrored posts.
//!
//! Pure functions, no state: decode, flip horizontally, re-encode. The
//! ledger keeps the original file identity; only the posted bytes change.

use std::io::Cursor;
use thiserror::Error;

/// Errors that can occur while producing a mirrored variant
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Failed to decode frame image: {0}")]
    Decode(image::ImageError),

    #[error("Failed to encode mirrored frame: {0}")]
    Encode(image::ImageError),
}

/// Produce the horizontally mirrored variant of a frame, as JPEG bytes.
pub fn mirror_image(bytes: &[u8]) -> Result<Vec<u8>, MirrorError> {
    let decoded = image::load_from_memory(bytes).map_err(MirrorError::Decode)?;
    let flipped = decoded.fliph();

    let mut out = Vec::new();
    flipped
        .to_rgb8()
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .map_err(MirrorError::Encode)?;
    Ok(out)
}
