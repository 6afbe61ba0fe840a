// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client profile rendering.
//!
//! Templates are plain wg-quick files with `{{NAME}}` placeholders, one per
//! device class. Substitution is a single pass over the template: values are
//! never rescanned, and a value containing a control character is refused so
//! no attribute can smuggle extra directives into the profile.

use std::io::Cursor;

use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wgfleet_types::DeviceClass;

use crate::peer::{Peer, ServerEndpoint};

const GENERIC: &str = include_str!("../templates/generic.conf");
const ANDROID: &str = include_str!("../templates/android.conf");
const IOS: &str = include_str!("../templates/ios.conf");
const WINDOWS: &str = include_str!("../templates/windows.conf");
const MACOS: &str = include_str!("../templates/macos.conf");
const LINUX: &str = include_str!("../templates/linux.conf");

const QR_MIN_SIZE: u32 = 256;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template references unknown placeholder {0:?}")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder in template line {0:?}")]
    Unterminated(String),

    #[error("value for {0} contains a control character")]
    InvalidValue(&'static str),

    #[error("failed to encode QR code: {0}")]
    Qr(#[from] qrcode::types::QrError),

    #[error("failed to encode PNG: {0}")]
    Image(#[from] image::ImageError),
}

/// Client-side tunnel settings shared by every rendered profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub dns: Vec<String>,
    pub allowed_ips: Vec<String>,
    /// Seconds, 0 disables keepalive.
    pub persistent_keepalive: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            dns: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            allowed_ips: vec!["0.0.0.0/0".into(), "::/0".into()],
            persistent_keepalive: 25,
        }
    }
}

fn template_for(class: DeviceClass) -> &'static str {
    match class {
        DeviceClass::Android => ANDROID,
        DeviceClass::Ios => IOS,
        DeviceClass::Windows => WINDOWS,
        DeviceClass::Macos => MACOS,
        DeviceClass::Linux => LINUX,
        DeviceClass::Generic => GENERIC,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigRenderer {
    settings: TunnelSettings,
}

impl ConfigRenderer {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Render the profile for `peer`. Pure: same inputs, same bytes.
    pub fn render(&self, peer: &Peer, server: &ServerEndpoint) -> Result<String, RenderError> {
        let keepalive = match self.settings.persistent_keepalive {
            0 => String::new(),
            secs => secs.to_string(),
        };

        let values = [
            ("DEVICE_NAME", peer.device_name.clone()),
            ("PRIVATE_KEY", peer.private_key.to_base64()),
            ("ADDRESS", format!("{}/{}", peer.address, server.subnet.prefix())),
            ("DNS", self.settings.dns.join(", ")),
            ("SERVER_PUBLIC_KEY", server.public_key.clone()),
            ("SERVER_ENDPOINT", server.endpoint.clone()),
            ("ALLOWED_IPS", self.settings.allowed_ips.join(", ")),
            ("PERSISTENT_KEEPALIVE", keepalive),
        ];

        let config = substitute(template_for(peer.device_class), &values)?;
        debug!(peer_id = %peer.id, device_class = %peer.device_class, "rendered config");
        Ok(config)
    }
}

fn substitute(template: &str, values: &[(&'static str, String)]) -> Result<String, RenderError> {
    for (name, value) in values {
        if value.chars().any(char::is_control) {
            return Err(RenderError::InvalidValue(name));
        }
    }

    let mut out = String::with_capacity(template.len() + 128);
    for line in template.lines() {
        let mut rendered = String::with_capacity(line.len());
        let mut rest = line;
        let mut empty_value = false;

        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| RenderError::Unterminated(line.to_string()))?;
            let name = &after[..end];
            let value = values
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| RenderError::UnknownPlaceholder(name.to_string()))?;
            empty_value |= value.is_empty();
            rendered.push_str(value);
            rest = &after[end + 2..];
        }

        // A directive with nothing to say is dropped rather than left dangling.
        if empty_value {
            continue;
        }
        rendered.push_str(rest);
        out.push_str(&rendered);
        out.push('\n');
    }
    Ok(out)
}

/// Encode a profile as a PNG QR code for phone import.
pub fn render_qr_png(config: &str) -> Result<Vec<u8>, RenderError> {
    let code = QrCode::with_error_correction_level(config.as_bytes(), EcLevel::M)?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .build();

    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}
