//! Pixel-size sniffing for image headers. The markdown image literal the
//! platform renders wants the true width/height, so we peek the first bytes
//! of the file instead of decoding it (a 64 KiB Range request is enough for
//! every supported container).

use qqgate_core::Result;
use reqwest::Client;
use tracing::debug;

/// How much of a remote image we fetch to find its dimensions.
const SNIFF_RANGE_BYTES: u64 = 64 * 1024;

/// Fallback dimensions when the header cannot be read.
pub const DEFAULT_SIZE: (u32, u32) = (512, 512);

/// Decode the pixel size out of PNG / JPEG / GIF / WebP header bytes.
pub fn decode_image_size(bytes: &[u8]) -> Option<(u32, u32)> {
    decode_png(bytes)
        .or_else(|| decode_jpeg(bytes))
        .or_else(|| decode_gif(bytes))
        .or_else(|| decode_webp(bytes))
}

fn decode_png(b: &[u8]) -> Option<(u32, u32)> {
    const SIG: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if b.len() < 24 || b[..8] != SIG {
        return None;
    }
    // First chunk must be IHDR; width/height are its first two fields.
    if &b[12..16] != b"IHDR" {
        return None;
    }
    let w = u32::from_be_bytes([b[16], b[17], b[18], b[19]]);
    let h = u32::from_be_bytes([b[20], b[21], b[22], b[23]]);
    (w > 0 && h > 0).then_some((w, h))
}

fn decode_jpeg(b: &[u8]) -> Option<(u32, u32)> {
    if b.len() < 4 || b[0] != 0xFF || b[1] != 0xD8 {
        return None;
    }
    // Walk marker segments until a start-of-frame carries the dimensions.
    let mut i = 2usize;
    while i + 9 < b.len() {
        if b[i] != 0xFF {
            return None;
        }
        let marker = b[i + 1];
        // Standalone markers without a length field.
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([b[i + 2], b[i + 3]]) as usize;
        if len < 2 {
            return None;
        }
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if i + 9 > b.len() {
                return None;
            }
            let h = u16::from_be_bytes([b[i + 5], b[i + 6]]) as u32;
            let w = u16::from_be_bytes([b[i + 7], b[i + 8]]) as u32;
            return (w > 0 && h > 0).then_some((w, h));
        }
        i += 2 + len;
    }
    None
}

fn decode_gif(b: &[u8]) -> Option<(u32, u32)> {
    if b.len() < 10 || (&b[..6] != b"GIF87a" && &b[..6] != b"GIF89a") {
        return None;
    }
    let w = u16::from_le_bytes([b[6], b[7]]) as u32;
    let h = u16::from_le_bytes([b[8], b[9]]) as u32;
    (w > 0 && h > 0).then_some((w, h))
}

fn decode_webp(b: &[u8]) -> Option<(u32, u32)> {
    if b.len() < 30 || &b[..4] != b"RIFF" || &b[8..12] != b"WEBP" {
        return None;
    }
    match &b[12..16] {
        // Lossy: frame tag then 9D 01 2A start code, 14-bit dimensions.
        b"VP8 " => {
            if b[23] != 0x9D || b[24] != 0x01 || b[25] != 0x2A {
                return None;
            }
            let w = (u16::from_le_bytes([b[26], b[27]]) & 0x3FFF) as u32;
            let h = (u16::from_le_bytes([b[28], b[29]]) & 0x3FFF) as u32;
            (w > 0 && h > 0).then_some((w, h))
        }
        // Lossless: 0x2F signature then width-1 / height-1 in 14-bit fields.
        b"VP8L" => {
            if b[20] != 0x2F {
                return None;
            }
            let bits = u32::from_le_bytes([b[21], b[22], b[23], b[24]]);
            let w = (bits & 0x3FFF) + 1;
            let h = ((bits >> 14) & 0x3FFF) + 1;
            Some((w, h))
        }
        // Extended: 24-bit canvas width-1 / height-1.
        b"VP8X" => {
            let w = (u32::from_le_bytes([b[24], b[25], b[26], 0]) & 0xFF_FFFF) + 1;
            let h = (u32::from_le_bytes([b[27], b[28], b[29], 0]) & 0xFF_FFFF) + 1;
            Some((w, h))
        }
        _ => None,
    }
}

/// Fetch just enough of a remote image to learn its dimensions. Servers that
/// ignore the Range header still work — we only read the prefix we need.
pub async fn fetch_image_size(client: &Client, url: &str) -> Result<Option<(u32, u32)>> {
    let resp = client
        .get(url)
        .header(
            reqwest::header::RANGE,
            format!("bytes=0-{}", SNIFF_RANGE_BYTES - 1),
        )
        .send()
        .await?;
    if !resp.status().is_success() {
        debug!(url = %url, status = %resp.status(), "Image size probe failed");
        return Ok(None);
    }
    let bytes = resp.bytes().await?;
    let prefix = &bytes[..bytes.len().min(SNIFF_RANGE_BYTES as usize)];
    Ok(decode_image_size(prefix))
}
