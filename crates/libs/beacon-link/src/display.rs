//! Monochrome framebuffer dump for `display_contents`.

use rmpv::Value;

use crate::codec::{Arguments, Reply};
use crate::error::HandlerError;

/// `cmd` value identifying a display dump reply.
pub const DISPLAY_CONTENTS_CMD: u8 = 0;

/// A 1-bit display whose buffer is packed into 8-pixel pages.
///
/// The buffer is column-major: byte `x * (height / 8) + page` holds pixels
/// `page * 8 ..= page * 8 + 7` of column `x`, least significant bit on top.
pub trait DisplaySource: Send {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn framebuffer(&self) -> &[u8];
}

/// Owned framebuffer, used by the simulator and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Framebuffer {
    /// Blank buffer; `height` is rounded up to whole pages.
    pub fn new(width: usize, height: usize) -> Self {
        let height = height.div_ceil(8) * 8;
        Self { width, height, pixels: vec![0; width * height / 8] }
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, on: bool) {
        if x >= self.width || y >= self.height {
            return;
        }
        let index = x * (self.height / 8) + y / 8;
        let mask = 1u8 << (y % 8);
        if on {
            self.pixels[index] |= mask;
        } else {
            self.pixels[index] &= !mask;
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.pixels[x * (self.height / 8) + y / 8] & (1 << (y % 8)) != 0
    }
}

impl DisplaySource for Framebuffer {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn framebuffer(&self) -> &[u8] {
        &self.pixels
    }
}

/// Regroup the column-major buffer into one byte row per page.
pub fn page_rows(source: &dyn DisplaySource) -> Result<Vec<Vec<u8>>, HandlerError> {
    let (width, height) = (source.width(), source.height());
    let buffer = source.framebuffer();
    let expected = width * height / 8;
    if height % 8 != 0 || buffer.len() != expected {
        return Err(HandlerError::DisplayGeometry { expected, actual: buffer.len() });
    }
    let pages = height / 8;
    Ok((0..pages)
        .map(|page| (0..width).map(|column| buffer[column * pages + page]).collect())
        .collect())
}

pub fn rpc_display_contents(
    source: &dyn DisplaySource,
    _args: &Arguments,
) -> Result<Reply, HandlerError> {
    let rows = page_rows(source)?;
    let buffer = rows
        .into_iter()
        .map(|row| Value::Array(row.into_iter().map(Value::from).collect()))
        .collect();
    Ok(Reply::new()
        .with("cmd", DISPLAY_CONTENTS_CMD)
        .with("width", source.width() as u64)
        .with("height", source.height() as u64)
        .with("buffer", Value::Array(buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl DisplaySource for Broken {
        fn width(&self) -> usize {
            128
        }

        fn height(&self) -> usize {
            64
        }

        fn framebuffer(&self) -> &[u8] {
            &[0; 16]
        }
    }

    #[test]
    fn pixels_land_in_column_major_pages() {
        let mut frame = Framebuffer::new(4, 16);
        frame.set_pixel(1, 9, true);
        assert!(frame.pixel(1, 9));
        assert_eq!(frame.framebuffer()[3], 0b10);

        let rows = page_rows(&frame).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![0, 0b10, 0, 0]);
        assert!(rows[0].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn reply_carries_geometry_and_rows() {
        let frame = Framebuffer::new(128, 64);
        let reply = rpc_display_contents(&frame, &Arguments::default()).expect("reply");
        assert_eq!(reply.u64("cmd"), Some(0));
        assert_eq!(reply.u64("width"), Some(128));
        assert_eq!(reply.u64("height"), Some(64));
        let rows = reply.get("buffer").and_then(Value::as_array).expect("buffer");
        assert_eq!(rows.len(), 8);
        assert!(rows.iter().all(|row| row.as_array().map(Vec::len) == Some(128)));
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        let err = rpc_display_contents(&Broken, &Arguments::default()).expect_err("mismatch");
        assert_eq!(err, HandlerError::DisplayGeometry { expected: 1024, actual: 16 });
        assert_eq!(err.to_string(), "display buffer size mismatch");
    }
}
