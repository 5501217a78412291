use anyhow::{anyhow, Result};

/// Where link challenges are shown to an operator.
pub trait LinkChallengeSink: Send + Sync {
    fn present(&self, code: &str);
}

/// Prints the challenge as a scannable QR code on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalQrSink;

impl LinkChallengeSink for TerminalQrSink {
    fn present(&self, code: &str) {
        match render_link_qr(code) {
            Ok(rendered) => {
                tracing::info!(
                    "Link challenge received. Scan the QR code below from WhatsApp > Linked devices"
                );
                eprintln!();
                eprintln!("{rendered}");
                eprintln!();
            }
            Err(err) => {
                tracing::warn!(
                    "Could not render link QR in terminal: {err}. Raw challenge: {}",
                    code.trim()
                );
            }
        }
    }
}

/// Sink that drops challenges. Used when no terminal is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSink;

impl LinkChallengeSink for SilentSink {
    fn present(&self, _code: &str) {}
}

pub fn render_link_qr(code: &str) -> Result<String> {
    let payload = code.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode link QR payload: {err}"))?;

    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_non_empty_payload() {
        let rendered = render_link_qr("2@AbCdEf,ghIjKl,mnOpQr").unwrap();
        assert!(rendered.lines().count() > 10);
    }

    #[test]
    fn rejects_blank_payload() {
        assert!(render_link_qr("   ").is_err());
    }
}
