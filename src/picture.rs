// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 8-bit 4:2:0 pictures.
//!
//! Pictures are shared as `Arc<Picture>`: an input picture is held by the coding subsystem until
//! its frame is coded, and a reconstructed picture is held both by the caller and by the next
//! frame's reference lookups. Acquiring a reference is an `Arc::clone`, freeing one is a drop.

use crate::Resolution;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

pub const NUM_PLANES: usize = 3;

/// Value written to freshly allocated pictures.
const MID_GREY: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    resolution: Resolution,
    planes: [Vec<u8>; NUM_PLANES],
    /// Presentation timestamp, passed through to the reconstruction
    pub pts: i64,
}

impl Picture {
    /// Allocates a mid-grey picture of `resolution`. Chroma planes are rounded up.
    pub fn new(resolution: Resolution) -> Self {
        let mut picture = Self {
            resolution,
            planes: Default::default(),
            pts: 0,
        };

        for plane in 0..NUM_PLANES {
            let size = picture.plane_width(plane) * picture.plane_height(plane);
            picture.planes[plane] = vec![MID_GREY; size];
        }

        picture
    }

    /// Builds a picture from a packed I420 buffer. Returns [`None`] if `data` is too short.
    pub fn from_i420(resolution: Resolution, data: &[u8], pts: i64) -> Option<Self> {
        let mut picture = Self::new(resolution);
        picture.pts = pts;

        let mut offset = 0;
        for plane in picture.planes.iter_mut() {
            let end = offset + plane.len();
            plane.copy_from_slice(data.get(offset..end)?);
            offset = end;
        }

        Some(picture)
    }

    /// Size in bytes of a packed I420 picture of `resolution`.
    pub fn i420_size(resolution: Resolution) -> usize {
        let chroma = ((resolution.width as usize + 1) / 2) * ((resolution.height as usize + 1) / 2);
        resolution.get_area() + 2 * chroma
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn plane_width(&self, plane: usize) -> usize {
        match plane {
            Y_PLANE => self.resolution.width as usize,
            _ => (self.resolution.width as usize + 1) / 2,
        }
    }

    pub fn plane_height(&self, plane: usize) -> usize {
        match plane {
            Y_PLANE => self.resolution.height as usize,
            _ => (self.resolution.height as usize + 1) / 2,
        }
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        &self.planes[plane]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        &mut self.planes[plane]
    }

    /// Returns line `y` of `plane`.
    pub fn line(&self, plane: usize, y: usize) -> &[u8] {
        let width = self.plane_width(plane);
        &self.planes[plane][y * width..(y + 1) * width]
    }

    /// Writes the picture as packed I420 into `writer`.
    pub fn write_i420(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        for plane in &self.planes {
            writer.write_all(plane)?;
        }

        Ok(())
    }

    /// CRC32 of all three planes.
    pub fn crc32(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for plane in &self.planes {
            hasher.update(plane);
        }
        hasher.finalize()
    }
}
