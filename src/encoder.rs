// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod row_coder;
pub mod session;

use std::sync::Arc;

use thiserror::Error;

use crate::bitstream::Bitstream;
use crate::config::ConfigError;
use crate::picture::Picture;
use crate::strategy::StrategyError;
use crate::threadqueue::JobError;
use crate::threadqueue::Promise;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error("frame {actual} was started while {expected} frames were started before it")]
    FrameOrder { expected: u64, actual: i64 },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("a picture was fed after the stream was flushed")]
    InputAfterFlush,
    #[error("the session is broken by an earlier error and must be closed")]
    Poisoned,
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Output of a finished frame job.
pub struct CodedFrame {
    /// Number of the frame in coding order
    pub frame_number: u64,
    /// Reconstructed picture, shared with later frames referencing it
    pub recon: Arc<Picture>,
    /// Coded data of the frame
    pub bitstream: Bitstream,
}

/// The coding subsystem driven by a [`Session`].
///
/// The session owns one [`FrameCoder::Slot`] per encoder state and calls into the coder to
/// initialize, link, prepare, feed, start and finalize them. Everything about how a frame is
/// actually coded, including how the work is spread across threads, is up to the implementation.
///
/// [`Session`]: session::Session
pub trait FrameCoder {
    /// Per-slot working data.
    type Slot;

    /// Pending work of one frame. Once [`Promise::sync`] returns, the frame's reconstruction and
    /// bitstream are final.
    type Job: Promise<Output = CodedFrame>;

    /// Creates the working data of slot `index` and binds the shared configuration to it.
    fn init_slot(&mut self, index: usize) -> EncodeResult<Self::Slot>;

    /// Links `slot` to the slot that precedes it in coding order. Called once per slot, in ring
    /// order, after all slots exist. [`None`] means the slot is its own predecessor.
    fn link_previous(
        &mut self,
        slot: &mut Self::Slot,
        previous: Option<&Self::Slot>,
    ) -> EncodeResult<()>;

    /// Claims `slot` for frame `frame_number`, resetting its per-frame state.
    fn prepare(&mut self, slot: &mut Self::Slot, frame_number: u64) -> EncodeResult<()>;

    /// Hands a picture to the coder, or [`None`] when draining. Returns true if this call made a
    /// frame ready to be encoded in `slot`. The coder may buffer pictures and return false.
    fn feed(&mut self, slot: &mut Self::Slot, picture: Option<Arc<Picture>>)
        -> EncodeResult<bool>;

    /// Starts encoding the frame made ready by [`FrameCoder::feed`] and returns its pending job.
    /// `previous` is the slot holding the previous frame, [`None`] if it is `slot` itself.
    fn submit(
        &mut self,
        slot: &mut Self::Slot,
        previous: Option<&Self::Slot>,
    ) -> EncodeResult<Self::Job>;

    /// Releases the slot's resources. Must cope with a slot in any state.
    fn finalize(&mut self, slot: Self::Slot);
}
