//! PNG text-chunk access.
//!
//! AI generators embed their parameters in `tEXt`/`iTXt` chunks, which the
//! image decoder does not surface, so the chunks are parsed natively: 4-byte
//! length (big-endian), 4-byte type, `length` bytes of data, 4-byte CRC.
//! tEXt chunks use keyword\0value format. iTXt chunks use
//! keyword\0compression_flag\0compression_method\0language\0translated_keyword\0text.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use image::DynamicImage;

use crate::error::AppError;

/// PNG file signature (8 bytes).
const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Extract all tEXt and iTXt chunks from a PNG file.
///
/// Returns a map of keyword -> text value. Files without a PNG signature
/// return an empty map.
pub fn read_text_chunks(path: &Path) -> Result<HashMap<String, String>, AppError> {
    let file = File::open(path)?;
    read_text_chunks_from(BufReader::new(file))
}

/// Extract all tEXt and iTXt chunks from an in-memory PNG stream.
pub fn read_text_chunks_from<R: Read>(mut reader: R) -> Result<HashMap<String, String>, AppError> {
    let mut sig = [0u8; 8];
    if reader.read_exact(&mut sig).is_err() || sig != PNG_SIGNATURE {
        return Ok(HashMap::new()); // Not a valid PNG
    }

    let mut chunks = HashMap::new();

    // Read chunks until IEND or EOF
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let chunk_len = u32::from_be_bytes(len_buf) as usize;

        let mut type_buf = [0u8; 4];
        if reader.read_exact(&mut type_buf).is_err() {
            break;
        }

        if &type_buf == b"IEND" {
            break;
        }

        if &type_buf == b"tEXt" || &type_buf == b"iTXt" {
            let mut data = vec![0u8; chunk_len];
            if reader.read_exact(&mut data).is_err() {
                break;
            }
            // Skip CRC (4 bytes)
            let mut crc_buf = [0u8; 4];
            let _ = reader.read_exact(&mut crc_buf);

            let parsed = if &type_buf == b"tEXt" {
                parse_text_chunk(&data)
            } else {
                parse_itxt_chunk(&data)
            };
            if let Some((keyword, value)) = parsed {
                chunks.insert(keyword, value);
            }
        } else {
            // Skip chunk data + CRC
            let mut skip_buf = vec![0u8; chunk_len + 4];
            if reader.read_exact(&mut skip_buf).is_err() {
                break;
            }
        }
    }

    Ok(chunks)
}

/// Parse a tEXt chunk: keyword\0value (both Latin-1, treated as UTF-8).
fn parse_text_chunk(data: &[u8]) -> Option<(String, String)> {
    let null_pos = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8_lossy(&data[..null_pos]).to_string();
    if keyword.is_empty() {
        return None;
    }
    let value = String::from_utf8_lossy(&data[null_pos + 1..]).to_string();
    Some((keyword, value))
}

/// Parse an iTXt chunk. Compressed iTXt (compression_flag == 1) is skipped;
/// AI generators write uncompressed text.
fn parse_itxt_chunk(data: &[u8]) -> Option<(String, String)> {
    let keyword_end = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8_lossy(&data[..keyword_end]).to_string();
    if keyword.is_empty() {
        return None;
    }

    let mut offset = keyword_end + 1;

    // compression_flag (1 byte) + compression_method (1 byte)
    if offset + 2 > data.len() {
        return None;
    }
    let compression_flag = data[offset];
    offset += 2;

    // language tag, then translated keyword (both null-terminated)
    for _ in 0..2 {
        let null_pos = data[offset..].iter().position(|&b| b == 0)?;
        offset += null_pos + 1;
    }

    if offset > data.len() || compression_flag != 0 {
        return None;
    }
    let text = String::from_utf8_lossy(&data[offset..]).to_string();
    Some((keyword, text))
}

/// Check whether an image is solid black (luminance extrema both zero).
///
/// Failed generations produce all-black frames; they carry no recoverable
/// metadata and are skipped before any format detection.
pub fn is_black_image(img: &DynamicImage) -> bool {
    let luma = img.to_luma8();
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for p in luma.pixels() {
        min = min.min(p[0]);
        max = max.max(p[0]);
    }
    min == 0 && max == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk_type);
        out.extend_from_slice(data);
        out.extend_from_slice(&[0u8; 4]); // CRC is not verified
        out
    }

    #[test]
    fn reads_text_chunk() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend(chunk(b"tEXt", b"parameters\0prompt text\nSteps: 20"));
        png.extend(chunk(b"IEND", b""));

        let chunks = read_text_chunks_from(Cursor::new(png)).unwrap();
        assert_eq!(
            chunks.get("parameters").map(String::as_str),
            Some("prompt text\nSteps: 20")
        );
    }

    #[test]
    fn reads_itxt_chunk() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend(chunk(b"iTXt", b"Comment\0\0\0\0\0{\"uc\": \"lowres\"}"));

        let chunks = read_text_chunks_from(Cursor::new(png)).unwrap();
        assert_eq!(
            chunks.get("Comment").map(String::as_str),
            Some("{\"uc\": \"lowres\"}")
        );
    }

    #[test]
    fn skips_unknown_chunks_and_compressed_itxt() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend(chunk(b"IHDR", &[0u8; 13]));
        png.extend(chunk(b"iTXt", b"zipped\0\x01\0\0\0data"));
        png.extend(chunk(b"tEXt", b"prompt\0{}"));
        png.extend(chunk(b"IEND", b""));

        let chunks = read_text_chunks_from(Cursor::new(png)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks.contains_key("prompt"));
    }

    #[test]
    fn non_png_yields_empty_map() {
        let chunks = read_text_chunks_from(Cursor::new(b"GIF89a".to_vec())).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn detects_black_image() {
        let black = DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
        assert!(is_black_image(&black));

        let mut gray = image::RgbImage::new(4, 4);
        gray.put_pixel(0, 0, image::Rgb([128, 128, 128]));
        assert!(!is_black_image(&DynamicImage::ImageRgb8(gray)));
    }
}
