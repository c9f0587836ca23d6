//! Pairing-artifact rendering.
//!
//! The transport hands over a raw pairing challenge string; the user needs a
//! scannable payload to authorize this device on the external network. The
//! challenge is rendered as an SVG QR code and wrapped in a data URI the
//! front door can embed directly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;
use thiserror::Error;

/// Pairing artifact errors
#[derive(Error, Debug)]
pub enum PairingError {
    /// The challenge could not be encoded as a QR code
    #[error("qr encoding failed: {0}")]
    Encode(String),
}

/// Render a raw pairing challenge into a `data:image/svg+xml` URI
pub fn render_pairing_artifact(challenge: &str) -> Result<String, PairingError> {
    let svg = QrCode::new(challenge)
        .map_err(|e| PairingError::Encode(e.to_string()))?
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#FFFFFF"))
        .build();

    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(svg.as_bytes())
    ))
}
