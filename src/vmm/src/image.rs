// SPDX-License-Identifier: Apache-2.0

//! Boot image loading.
//!
//! A boot image is a 24-byte little-endian header of six `u32` fields
//! (text base/size, data base/size, bss base/size) followed by the text
//! bytes and then the initialized data bytes.

use std::fs;
use std::io;
use std::path::Path;

use crate::machine::PROGRAM_BASE;

/// Custom defined [`std::result::Result`]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read boot image: {0}")]
    Io(#[from] io::Error),

    #[error("boot image truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("TEXT_SIZE {0} is not a multiple of 8")]
    UnalignedText(u32),
}

/// Placement of the three program segments in guest RAM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramLayout {
    pub text_base: u32,
    pub text_size: u32,
    pub data_base: u32,
    pub data_size: u32,
    pub bss_base: u32,
    pub bss_size: u32,
}

const HEADER_LEN: usize = 24;

/// A parsed boot image, ready to be applied to guest RAM.
#[derive(Debug, Clone, Default)]
pub struct LoadedImage {
    pub layout: ProgramLayout,
    pub text: Vec<u8>,
    pub data: Vec<u8>,
}

impl LoadedImage {
    /// Build an image from raw instruction words, placed at the default
    /// program base with no data segment. Test and selftest programs are
    /// assembled this way.
    pub fn from_words(words: &[u64]) -> Self {
        let mut text = Vec::with_capacity(words.len() * 8);
        for word in words {
            text.extend_from_slice(&word.to_le_bytes());
        }
        LoadedImage {
            layout: ProgramLayout {
                text_base: PROGRAM_BASE,
                text_size: text.len() as u32,
                data_base: PROGRAM_BASE + text.len() as u32,
                ..Default::default()
            },
            text,
            data: Vec::new(),
        }
    }
}

pub fn load(path: &Path) -> Result<LoadedImage> {
    parse(&fs::read(path)?)
}

pub fn parse(bytes: &[u8]) -> Result<LoadedImage> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Truncated { expected: HEADER_LEN, found: bytes.len() });
    }
    let field = |index: usize| {
        let offset = index * 4;
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };
    let layout = ProgramLayout {
        text_base: field(0),
        text_size: field(1),
        data_base: field(2),
        data_size: field(3),
        bss_base: field(4),
        bss_size: field(5),
    };

    if layout.text_size % 8 != 0 {
        return Err(Error::UnalignedText(layout.text_size));
    }

    let expected = HEADER_LEN + layout.text_size as usize + layout.data_size as usize;
    if bytes.len() < expected {
        return Err(Error::Truncated { expected, found: bytes.len() });
    }

    let text_end = HEADER_LEN + layout.text_size as usize;
    Ok(LoadedImage {
        layout,
        text: bytes[HEADER_LEN..text_end].to_vec(),
        data: bytes[text_end..expected].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(layout: &ProgramLayout) -> Vec<u8> {
        let mut bytes = Vec::new();
        for field in [
            layout.text_base,
            layout.text_size,
            layout.data_base,
            layout.data_size,
            layout.bss_base,
            layout.bss_size,
        ] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parses_header_text_and_data() {
        let layout = ProgramLayout {
            text_base: 0x2020,
            text_size: 16,
            data_base: 0x3000,
            data_size: 3,
            bss_base: 0x4000,
            bss_size: 100,
        };
        let mut bytes = header(&layout);
        bytes.extend_from_slice(&[0x11; 16]);
        bytes.extend_from_slice(b"abc");

        let image = parse(&bytes).unwrap();
        assert_eq!(image.layout, layout);
        assert_eq!(image.text, vec![0x11; 16]);
        assert_eq!(image.data, b"abc");
    }

    #[test]
    fn rejects_unaligned_text() {
        let layout = ProgramLayout { text_size: 12, ..Default::default() };
        let mut bytes = header(&layout);
        bytes.extend_from_slice(&[0; 12]);
        assert!(matches!(parse(&bytes), Err(Error::UnalignedText(12))));
    }

    #[test]
    fn rejects_truncated_images() {
        assert!(matches!(parse(&[0; 10]), Err(Error::Truncated { .. })));

        let layout = ProgramLayout { text_size: 32, ..Default::default() };
        let mut bytes = header(&layout);
        bytes.extend_from_slice(&[0; 16]); // half the promised text
        assert!(matches!(parse(&bytes), Err(Error::Truncated { .. })));
    }

    #[test]
    fn from_words_encodes_little_endian_at_program_base() {
        let image = LoadedImage::from_words(&[0x0102_0304_0506_0708]);
        assert_eq!(image.layout.text_base, PROGRAM_BASE);
        assert_eq!(image.layout.text_size, 8);
        assert_eq!(image.text, vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }
}
