use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

use crate::error::ChannelError;

const QR_MIN_DIMENSION: u32 = 256;

/// Encode a raw pairing payload as a QR code and return it as an SVG data URL.
pub fn qr_data_url(payload: &str) -> Result<String, ChannelError> {
    if payload.is_empty() {
        return Err(ChannelError::Pairing("empty pairing payload".to_string()));
    }

    let code = QrCode::new(payload.as_bytes()).map_err(|e| ChannelError::Pairing(e.to_string()))?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();

    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}
