//! In-place GIF frame-delay repair.
//!
//! Many GIFs on gallery hosts declare a frame delay of `0` or `1` hundredths of a
//! second. Browsers never play those at face value; they clamp them to 100 ms.
//! Decoders that honour the declared value spin through such animations at
//! full CPU. This module rewrites those delays to [`REPAIRED_DELAY`] directly in
//! the file, touching only the two delay bytes of each affected Graphic Control
//! Extension, so the file stays the same length and remains a valid GIF.
//!
//! ## Block walk
//!
//! ```text
//! "GIF8?a" | screen descriptor (7) | [global color table]
//! ( 0x21 label sub-blocks… | 0x2C descriptor (9) [local table] lzw sub-blocks… )*
//! 0x3B
//! ```
//!
//! A truncated stream stops the walk; delays found before the cut are still
//! repaired.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Delay (hundredths of a second) written over too-short frame delays.
pub const REPAIRED_DELAY: u16 = 10;

/// Declared delays at or below this value are repaired.
const MAX_SHORT_DELAY: u16 = 1;

const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_SEPARATOR: u8 = 0x2C;
const TRAILER: u8 = 0x3B;
const GRAPHIC_CONTROL_LABEL: u8 = 0xF9;

#[derive(Error, Debug)]
pub enum GifError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("not a GIF stream")]
    NotGif,
}

/// Offsets of every delay field whose value needs repair.
pub fn find_short_delays(data: &[u8]) -> Result<Vec<usize>, GifError> {
    if data.len() < 13 || !(data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a")) {
        return Err(GifError::NotGif);
    }

    let mut offsets = Vec::new();
    let mut pos = 13 + color_table_len(data[10]);

    while let Some(&block) = data.get(pos) {
        match block {
            EXTENSION_INTRODUCER => {
                let Some(&label) = data.get(pos + 1) else { break };
                let body = pos + 2;
                if label == GRAPHIC_CONTROL_LABEL && data.get(body) == Some(&4) {
                    let delay_at = body + 2;
                    if let Some(delay) = read_u16(data, delay_at)
                        && delay <= MAX_SHORT_DELAY
                    {
                        offsets.push(delay_at);
                    }
                }
                match skip_sub_blocks(data, body) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
            IMAGE_SEPARATOR => {
                let Some(&packed) = data.get(pos + 9) else { break };
                // descriptor + optional local table + LZW minimum code size
                let lzw = pos + 10 + color_table_len(packed) + 1;
                match skip_sub_blocks(data, lzw) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
            TRAILER => break,
            _ => break,
        }
    }

    Ok(offsets)
}

/// Repair frame delays inside an in-memory GIF. Returns the number of frames changed.
pub fn repair_frame_delays(data: &mut [u8]) -> Result<usize, GifError> {
    let offsets = find_short_delays(data)?;
    for &at in &offsets {
        data[at..at + 2].copy_from_slice(&REPAIRED_DELAY.to_le_bytes());
    }
    Ok(offsets.len())
}

/// Repair frame delays of a GIF file in place.
///
/// Only the affected delay fields are rewritten; the file is never truncated
/// or re-created. Running it twice is a no-op the second time.
pub fn rewrite_file(path: &Path) -> Result<usize, GifError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let offsets = find_short_delays(&data)?;
    for &at in &offsets {
        file.seek(SeekFrom::Start(at as u64))?;
        file.write_all(&REPAIRED_DELAY.to_le_bytes())?;
    }
    file.flush()?;
    Ok(offsets.len())
}

fn color_table_len(packed: u8) -> usize {
    if packed & 0x80 == 0 {
        0
    } else {
        3 * (1usize << ((packed & 0x07) + 1))
    }
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Position just past the zero-length terminator of a sub-block chain.
fn skip_sub_blocks(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            return Some(pos);
        }
        pos += len;
    }
}
