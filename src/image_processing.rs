// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion of decoded frames to linear layouts.

use thiserror::Error;

use crate::Resolution;

/// Memory layout of an NV12 frame in a CAPTURE buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub resolution: Resolution,
    /// Bytes per line of both planes.
    pub stride: u32,
    /// Number of lines of the luma plane, including padding.
    pub scanlines: u32,
}

impl FrameLayout {
    /// Offset of the chroma plane.
    pub fn uv_offset(&self) -> usize {
        self.stride as usize * self.scanlines as usize
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("invalid layout {0:?}")]
    InvalidLayout(FrameLayout),
    #[error("source buffer too small: {needed} bytes needed, {available} available")]
    SourceTooSmall { needed: usize, available: usize },
}

/// Converts frames from the decoder's layout into a linear one.
pub trait FormatConverter {
    /// Converts the frame in `src` laid out as `layout`, replacing the contents of `dst` with the
    /// converted image. Returns the number of bytes written.
    fn convert(
        &mut self,
        src: &[u8],
        layout: FrameLayout,
        dst: &mut Vec<u8>,
    ) -> Result<usize, ConvertError>;
}

/// Copies `src` into `dst` as NV12, removing any extra padding.
///
/// `strides` and `offsets` give the stride and starting position of the Y and UV planes in `src`.
pub fn nv12_copy(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) {
    // Copy Y.
    let src_y_lines = src[offsets[0]..].chunks(strides[0]).map(|line| &line[..width]);
    let dst_y_lines = dst.chunks_mut(width);

    for (src_line, dst_line) in src_y_lines.zip(dst_y_lines).take(height) {
        dst_line.copy_from_slice(src_line);
    }

    let dst_u_offset = width * height;

    // Align width and height to 2 for UV plane.
    // 1 sample per 4 pixels, but we have two components per line so width can remain as-is.
    let uv_width = width.next_multiple_of(2);
    let uv_height = height.div_ceil(2);

    // Copy UV.
    let src_uv_lines = src[offsets[1]..].chunks(strides[1]).map(|line| &line[..uv_width]);
    let dst_uv_lines = dst[dst_u_offset..].chunks_mut(uv_width);
    for (src_line, dst_line) in src_uv_lines.zip(dst_uv_lines).take(uv_height) {
        dst_line.copy_from_slice(src_line);
    }
}

/// Size of a tightly packed NV12 image.
pub fn nv12_linear_size(resolution: Resolution) -> usize {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    width * height + width.next_multiple_of(2) * height.div_ceil(2)
}

/// Strips the stride and scanline padding of NV12 frames.
#[derive(Debug, Default)]
pub struct Nv12Linearizer;

impl Nv12Linearizer {
    fn check(src: &[u8], layout: FrameLayout) -> Result<(), ConvertError> {
        let width = layout.resolution.width as usize;
        let height = layout.resolution.height as usize;
        let stride = layout.stride as usize;

        if layout.resolution.is_empty()
            || stride < width.next_multiple_of(2)
            || (layout.scanlines as usize) < height
        {
            return Err(ConvertError::InvalidLayout(layout));
        }

        // The last line of each plane does not need to be padded.
        let needed =
            layout.uv_offset() + stride * (height.div_ceil(2) - 1) + width.next_multiple_of(2);
        if src.len() < needed {
            return Err(ConvertError::SourceTooSmall { needed, available: src.len() });
        }

        Ok(())
    }
}

impl FormatConverter for Nv12Linearizer {
    fn convert(
        &mut self,
        src: &[u8],
        layout: FrameLayout,
        dst: &mut Vec<u8>,
    ) -> Result<usize, ConvertError> {
        Self::check(src, layout)?;

        let size = nv12_linear_size(layout.resolution);
        dst.clear();
        dst.resize(size, 0);

        let stride = layout.stride as usize;
        nv12_copy(
            src,
            dst,
            layout.resolution.width as usize,
            layout.resolution.height as usize,
            [stride, stride],
            [0, layout.uv_offset()],
        );

        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_padding() {
        // 2x2 frame, 4 bytes stride, 3 scanlines.
        #[rustfmt::skip]
        let src = [
            1, 2, 0xff, 0xff,
            3, 4, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff,
            5, 6, 0xff, 0xff,
        ];
        let resolution = Resolution { width: 2, height: 2 };
        let layout = FrameLayout { resolution, stride: 4, scanlines: 3 };

        let mut dst = vec![0xaa; 100];
        let written = Nv12Linearizer.convert(&src, layout, &mut dst).unwrap();
        assert_eq!(written, 6);
        assert_eq!(dst, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn odd_dimensions() {
        let resolution = Resolution { width: 3, height: 3 };
        assert_eq!(nv12_linear_size(resolution), 9 + 8);

        let layout = FrameLayout { resolution, stride: 4, scanlines: 4 };
        let src: Vec<u8> = (0..24).collect();
        let mut dst = Vec::new();
        Nv12Linearizer.convert(&src, layout, &mut dst).unwrap();
        assert_eq!(dst, vec![0, 1, 2, 4, 5, 6, 8, 9, 10, 16, 17, 18, 19, 20, 21, 22, 23]);
    }

    #[test]
    fn invalid_input() {
        let resolution = Resolution { width: 16, height: 16 };
        let mut dst = Vec::new();

        let narrow = FrameLayout { resolution, stride: 8, scanlines: 16 };
        assert_eq!(
            Nv12Linearizer.convert(&[0; 1024], narrow, &mut dst),
            Err(ConvertError::InvalidLayout(narrow))
        );

        let layout = FrameLayout { resolution, stride: 16, scanlines: 16 };
        assert_eq!(
            Nv12Linearizer.convert(&[0; 100], layout, &mut dst),
            Err(ConvertError::SourceTooSmall { needed: 384, available: 100 })
        );
    }
}
