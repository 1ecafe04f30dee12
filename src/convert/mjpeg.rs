use jpeg_decoder::{Decoder, PixelFormat as JpegPixels};

use crate::error::{BridgeError, Result};

pub(super) struct Decoded {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
}

/// Decodes one MJPEG frame to packed RGB24 or L8.
pub(super) fn decode(data: &[u8]) -> Result<Decoded> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| BridgeError::InvalidFrame(format!("corrupt JPEG: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| BridgeError::InvalidFrame("JPEG without header".into()))?;

    let bytes_per_pixel = match info.pixel_format {
        JpegPixels::RGB24 => 3,
        JpegPixels::L8 => 1,
        other => {
            return Err(BridgeError::FormatUnsupported(format!(
                "JPEG pixel format {other:?}"
            )))
        }
    };
    Ok(Decoded {
        pixels,
        width: info.width as u32,
        height: info.height as u32,
        bytes_per_pixel,
    })
}
