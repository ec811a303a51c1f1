//! Stealth-pnginfo payload recovery.
//!
//! Some tools hide their generation parameters in the least-significant bits
//! of pixel channels after the regular metadata chunks are stripped. The
//! payload starts with one of four 15-byte ASCII signatures, followed by a
//! bit-length field and the payload bits themselves:
//!
//! - `stealth_pnginfo` / `stealth_pngcomp`: alpha channel, 1 bit per pixel,
//!   32-bit length field
//! - `stealth_rgbinfo` / `stealth_rgbcomp`: R/G/B channels, 3 bits per pixel,
//!   33-bit length window whose last bit belongs to the payload
//!
//! The `*comp` variants are gzip-compressed. Pixels are scanned column by
//! column (outer x, inner y); the signature and length are reconstructed
//! bit-by-bit, so any other traversal order decodes garbage.

use std::io::Read;

use flate2::read::GzDecoder;
use image::DynamicImage;

const SIG_BITS: usize = "stealth_pnginfo".len() * 8;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    ConfirmingSignature,
    ReadingLength,
    ReadingPayload,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Alpha,
    Rgb,
}

/// Bit arena filled one LSB at a time during the scan.
#[derive(Debug, Default)]
struct BitBuffer {
    bits: Vec<u8>,
}

impl BitBuffer {
    fn push(&mut self, bit: u8) {
        self.bits.push(bit);
    }

    fn len(&self) -> usize {
        self.bits.len()
    }

    fn clear(&mut self) {
        self.bits.clear();
    }

    fn truncate(&mut self, len: usize) {
        self.bits.truncate(len);
    }

    fn pop(&mut self) -> Option<u8> {
        self.bits.pop()
    }

    /// Interpret the whole buffer as a big-endian unsigned integer.
    fn value(&self) -> u64 {
        self.bits.iter().fold(0u64, |acc, &b| (acc << 1) | b as u64)
    }

    /// Group bits into bytes, most significant bit first. A trailing partial
    /// group becomes a low-valued byte, matching the encoder's framing.
    fn to_bytes(&self) -> Vec<u8> {
        self.bits
            .chunks(8)
            .map(|chunk| chunk.iter().fold(0u8, |acc, &b| (acc << 1) | b))
            .collect()
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bits)
            .chunks(8)
            .map(|chunk| chunk.iter().fold(0u8, |acc, &b| (acc << 1) | b))
            .collect()
    }
}

/// Recover a steganographically embedded text payload from pixel data.
///
/// Returns `None` when no valid signature is present or when the payload
/// fails to decode — absence is the overwhelmingly common case and must be
/// cheap and silent.
pub fn decode(img: &DynamicImage) -> Option<String> {
    let has_alpha = img.color().has_alpha();
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut buf_a = BitBuffer::default();
    let mut buf_rgb = BitBuffer::default();
    let mut phase = Phase::ConfirmingSignature;
    let mut mode = Mode::Alpha;
    let mut compressed = false;
    let mut param_len = 0usize;
    let mut payload: Option<Vec<u8>> = None;

    'scan: for x in 0..width {
        for y in 0..height {
            let p = rgba.get_pixel(x, y).0;
            if has_alpha {
                buf_a.push(p[3] & 1);
            }
            buf_rgb.push(p[0] & 1);
            buf_rgb.push(p[1] & 1);
            buf_rgb.push(p[2] & 1);

            match phase {
                Phase::ConfirmingSignature => {
                    if has_alpha && buf_a.len() == SIG_BITS {
                        match buf_a.to_bytes().as_slice() {
                            b"stealth_pnginfo" => {}
                            b"stealth_pngcomp" => compressed = true,
                            _ => return None,
                        }
                        mode = Mode::Alpha;
                        phase = Phase::ReadingLength;
                        buf_a.clear();
                    } else if buf_rgb.len() == SIG_BITS {
                        match buf_rgb.to_bytes().as_slice() {
                            b"stealth_rgbinfo" => {}
                            b"stealth_rgbcomp" => compressed = true,
                            _ => {
                                if has_alpha {
                                    // The alpha signature may still confirm.
                                    continue;
                                }
                                return None;
                            }
                        }
                        mode = Mode::Rgb;
                        phase = Phase::ReadingLength;
                        buf_rgb.clear();
                    }
                }
                Phase::ReadingLength => match mode {
                    Mode::Alpha => {
                        if buf_a.len() == 32 {
                            param_len = buf_a.value() as usize;
                            phase = Phase::ReadingPayload;
                            buf_a.clear();
                        }
                    }
                    Mode::Rgb => {
                        // The 33-bit window overshoots by one bit, which is
                        // re-fed as the first payload bit.
                        if buf_rgb.len() == 33 {
                            let popped = buf_rgb.pop().unwrap_or(0);
                            param_len = buf_rgb.value() as usize;
                            phase = Phase::ReadingPayload;
                            buf_rgb.clear();
                            buf_rgb.push(popped);
                        }
                    }
                },
                Phase::ReadingPayload => match mode {
                    Mode::Alpha => {
                        if buf_a.len() == param_len {
                            payload = Some(buf_a.take());
                            break 'scan;
                        }
                    }
                    Mode::Rgb => {
                        if buf_rgb.len() >= param_len {
                            buf_rgb.truncate(param_len);
                            payload = Some(buf_rgb.take());
                            break 'scan;
                        }
                    }
                },
            }
        }
    }

    let bytes = payload?;
    if bytes.is_empty() {
        return None;
    }

    if compressed {
        let mut text = String::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_string(&mut text)
            .ok()?;
        Some(text)
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}
