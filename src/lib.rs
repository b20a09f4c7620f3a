// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session-level pipeline controller for a frame-parallel video encoder.
//!
//! An encoding [`Session`] owns a fixed ring of encoder states ("slots"). Every call to
//! [`Session::encode`] feeds at most one picture into the current slot, starts its asynchronous
//! encode when the coding subsystem is ready, rotates to the next slot and, if that slot still
//! holds work, blocks until it is finished and hands its reconstruction and bitstream back. The
//! depth of the ring is the overlapped-wavefront (OWF) depth plus one, which bounds the number of
//! frames in flight while keeping the output in input order.
//!
//! [`open`] builds a session around the default [`RowCoder`]; any other implementation of
//! [`FrameCoder`] can be plugged in with [`Session::new`].

pub mod bitstream;
pub mod config;
pub mod encoder;
pub mod picture;
pub mod strategy;
pub mod syntax;
pub mod threadqueue;

use std::str::FromStr;

pub use crate::config::Config;
pub use crate::config::EncoderControl;
pub use crate::encoder::row_coder::RowCoder;
pub use crate::encoder::session::EncodedOutput;
pub use crate::encoder::session::Session;
pub use crate::encoder::EncodeError;
pub use crate::encoder::EncodeResult;
pub use crate::encoder::FrameCoder;
pub use crate::picture::Picture;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Number of samples covered by this resolution.
    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl FromStr for Resolution {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(['x', 'X'])
            .ok_or("unrecognized resolution. Expected WIDTHxHEIGHT")?;

        let width = width.trim().parse().map_err(|_| "invalid resolution width")?;
        let height = height.trim().parse().map_err(|_| "invalid resolution height")?;

        Ok(Self { width, height })
    }
}

/// Opens an encoding session using the default [`RowCoder`].
///
/// Initializes the process-wide kernel strategies first (a no-op if another session already did),
/// then validates `config` and builds the slot ring. No session is returned on failure and
/// everything allocated on the way is released.
pub fn open(config: Config) -> EncodeResult<Session<RowCoder>> {
    let strategies = strategy::init(config.cpuid)?;
    let control = config.validate()?;
    let coder = RowCoder::new(&control, strategies)?;

    Session::new(control, coder)
}
