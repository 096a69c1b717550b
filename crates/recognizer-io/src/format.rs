//! Image format sniffing. Only JPEG and PNG reach the backend.

use image::ImageFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("image is empty")]
    Empty,
    #[error("unrecognized image data")]
    Unrecognized,
    #[error("unsupported image format {0:?}, expected JPEG or PNG")]
    Unsupported(ImageFormat),
    #[error("decoding image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Check the magic bytes of `bytes`, accepting JPEG and PNG.
pub fn ensure_supported(bytes: &[u8]) -> Result<ImageFormat, FormatError> {
    if bytes.is_empty() {
        return Err(FormatError::Empty);
    }
    match image::guess_format(bytes) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png)) => Ok(format),
        Ok(other) => Err(FormatError::Unsupported(other)),
        Err(_) => Err(FormatError::Unrecognized),
    }
}

/// Decode just enough of the image to report its size.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), FormatError> {
    let format = ensure_supported(bytes)?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;
    Ok((decoded.width(), decoded.height()))
}

#[cfg(test)]
pub(crate) fn tiny_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .expect("encoding PNG in memory");
    buf.into_inner()
}
