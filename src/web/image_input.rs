// Image decoding and normalization for uploaded files.

use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageInputError {
    #[error("empty upload")]
    Empty,
    #[error("not a decodable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode raw upload bytes (any enabled raster format) and normalize to 8-bit RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ImageInputError> {
    if bytes.is_empty() {
        return Err(ImageInputError::Empty);
    }
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}

/// PNG-encode and base64 an image for the runtime protocol.
pub fn encode_png_base64(image: &RgbImage) -> Result<String, ImageInputError> {
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(STANDARD.encode(png))
}

/// Inverse of [`encode_png_base64`].
pub fn decode_png_base64(payload: &str) -> Result<RgbImage, ImageInputError> {
    let bytes = STANDARD.decode(payload)?;
    decode_rgb(&bytes)
}
