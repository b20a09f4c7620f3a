// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The encoding session: a fixed ring of encoder states driven one call at a time.
//!
//! Every call to [`Session::encode`] claims the current slot for the next frame if needed, feeds
//! it, starts the frame when the coder says it is ready, then rotates to the next slot. If that
//! slot still holds a started frame the call blocks on its job and hands its output back. Since
//! the rotation never skips a slot, outputs come out in the order frames were started, whatever
//! order the jobs actually finish in, and at most [`Session::num_slots`] frames are ever in
//! flight.

use std::sync::Arc;

use crate::bitstream::Bitstream;
use crate::bitstream::DataChunks;
use crate::config::EncoderControl;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::FrameCoder;
use crate::picture::Picture;
use crate::threadqueue::Promise;

/// What a single [`Session::encode`] call produced. Both are [`None`] while the pipeline is
/// filling up or once it is drained.
#[derive(Default)]
pub struct EncodedOutput {
    /// Reconstruction of the finished frame, shared with the coder
    pub picture: Option<Arc<Picture>>,
    /// Coded data of the finished frame, owned by the caller
    pub chunks: Option<DataChunks>,
}

/// One slot of the ring.
struct EncoderState<S, J> {
    /// Frame assigned to the slot, -1 until the first one
    frame_number: i64,
    prepared: bool,
    /// False from the moment a frame is started in the slot until its output is handed out
    frame_done: bool,
    /// Index of the slot holding the preceding frame
    previous: usize,
    pending_job: Option<J>,
    stream: Bitstream,
    slot: S,
}

/// Borrows `items[index]` mutably and `items[other]` immutably. Returns [`None`] for the latter
/// when both are the same item.
fn split_pair<T>(items: &mut [T], index: usize, other: usize) -> (&mut T, Option<&T>) {
    if index == other {
        (&mut items[index], None)
    } else if index < other {
        let (head, tail) = items.split_at_mut(other);
        (&mut head[index], Some(&tail[0]))
    } else {
        let (head, tail) = items.split_at_mut(index);
        (&mut tail[0], Some(&head[other]))
    }
}

pub struct Session<C: FrameCoder> {
    states: Vec<EncoderState<C::Slot, C::Job>>,
    cur_state_index: usize,
    frames_started: u64,
    frames_done: u64,
    /// Set once a drain call had nothing left to start
    stream_ended: bool,
    poisoned: bool,
    control: EncoderControl,
    coder: C,
}

impl<C: FrameCoder> Session<C> {
    /// Builds the ring of `control.num_states()` slots around `coder`. On failure, the slots
    /// that were already initialized are finalized before the error is returned.
    pub fn new(control: EncoderControl, coder: C) -> EncodeResult<Self> {
        let num_states = control.num_states();

        let mut session = Self {
            states: Vec::new(),
            cur_state_index: 0,
            frames_started: 0,
            frames_done: 0,
            stream_ended: false,
            poisoned: false,
            control,
            coder,
        };

        session
            .states
            .try_reserve_exact(num_states)
            .map_err(anyhow::Error::from)?;

        for index in 0..num_states {
            let slot = session.coder.init_slot(index)?;
            session.states.push(EncoderState {
                frame_number: -1,
                prepared: false,
                frame_done: true,
                previous: (index + num_states - 1) % num_states,
                pending_job: None,
                stream: Bitstream::new(),
                slot,
            });
        }

        // Every slot exists before any is linked, linking may look at the predecessor.
        for index in 0..num_states {
            let previous = session.states[index].previous;
            let (state, previous) = split_pair(&mut session.states, index, previous);
            session
                .coder
                .link_previous(&mut state.slot, previous.map(|previous| &previous.slot))?;
        }

        log::debug!(
            "opened session: {:?}, owf {}, {} slots",
            session.control.resolution,
            session.control.owf,
            num_states
        );

        Ok(session)
    }

    /// Advances the pipeline by one step.
    ///
    /// `picture` is the next input, or [`None`] to drain the pipeline. Returns the output of at
    /// most one finished frame, always the oldest one not handed out yet. Repeated drain calls
    /// eventually return all frames and then nothing.
    ///
    /// Any error but [`EncodeError::InputAfterFlush`] leaves the session unusable: later calls
    /// fail with [`EncodeError::Poisoned`] and the session should be closed.
    pub fn encode(&mut self, picture: Option<Arc<Picture>>) -> EncodeResult<EncodedOutput> {
        if self.poisoned {
            return Err(EncodeError::Poisoned);
        }

        if picture.is_some() && self.stream_ended {
            return Err(EncodeError::InputAfterFlush);
        }

        let result = self.advance(picture);
        if let Err(e) = &result {
            log::error!("encoding failed, closing the pipeline: {e}");
            self.poisoned = true;
        }

        result
    }

    fn advance(&mut self, picture: Option<Arc<Picture>>) -> EncodeResult<EncodedOutput> {
        let draining = picture.is_none();
        let index = self.cur_state_index;

        if !self.states[index].prepared {
            self.prepare(index)?;
        }

        if let Some(picture) = &picture {
            log::trace!(
                "read source frame: {}",
                self.states[index].frame_number + self.control.seek as i64
            );
            log::trace!("picture pts {} into slot {index}", picture.pts);
        }

        let previous = self.states[index].previous;
        let (state, previous) = split_pair(&mut self.states, index, previous);

        let started = self.coder.feed(&mut state.slot, picture)?;
        if started {
            if state.frame_number != self.frames_started as i64 {
                return Err(EncodeError::FrameOrder {
                    expected: self.frames_started,
                    actual: state.frame_number,
                });
            }

            let job = self
                .coder
                .submit(&mut state.slot, previous.map(|previous| &previous.slot))?;
            state.pending_job = Some(job);
            state.frame_done = false;
            self.frames_started += 1;

            log::trace!("started frame {} in slot {index}", state.frame_number);
        }

        // Nothing was left to start, the end of the stream is final from here on.
        if draining && !started {
            self.stream_ended = true;
        }

        if self.is_quiescent() {
            return Ok(Default::default());
        }

        self.cur_state_index = (self.cur_state_index + 1) % self.states.len();
        let next = &mut self.states[self.cur_state_index];

        if next.frame_done {
            return Ok(Default::default());
        }

        let job = next
            .pending_job
            .take()
            .ok_or(EncodeError::InvalidInternalState)?;
        let coded = job.sync()?;

        if coded.frame_number as i64 != next.frame_number {
            log::error!(
                "slot {} holds frame {} but its job coded frame {}",
                self.cur_state_index,
                next.frame_number,
                coded.frame_number
            );
            return Err(EncodeError::InvalidInternalState);
        }

        next.stream.append(coded.bitstream);
        let output = EncodedOutput {
            picture: Some(coded.recon),
            chunks: Some(next.stream.take_chunks()),
        };

        next.frame_done = true;
        next.prepared = false;
        self.frames_done += 1;

        log::trace!(
            "frame {} done, {} frames in flight",
            coded.frame_number,
            self.frames_started - self.frames_done
        );

        Ok(output)
    }

    /// Claims slot `index` for the frame following the one in its predecessor.
    fn prepare(&mut self, index: usize) -> EncodeResult<()> {
        let previous = self.states[index].previous;
        let frame_number = self.states[previous].frame_number + 1;

        let state = &mut self.states[index];
        state.frame_number = frame_number;
        state.prepared = true;

        self.coder.prepare(&mut state.slot, frame_number as u64)
    }

    /// Tears the session down. Pending frames are waited for and discarded.
    pub fn close(self) {
        log::debug!(
            "closing session after {} frames, {} in flight",
            self.frames_done,
            self.frames_started - self.frames_done
        );
    }

    /// Number of slots in the ring, ie. the OWF depth plus one.
    pub fn num_slots(&self) -> usize {
        self.states.len()
    }

    pub fn frames_started(&self) -> u64 {
        self.frames_started
    }

    pub fn frames_done(&self) -> u64 {
        self.frames_done
    }

    /// True when every started frame has been handed out. Pictures still buffered by the coder
    /// are not counted, see [`Session::is_flushed`].
    pub fn is_quiescent(&self) -> bool {
        self.frames_done == self.frames_started
    }

    /// True once a drain call found nothing left to start and every started frame has been
    /// handed out. Draining until this holds returns every picture that was fed.
    pub fn is_flushed(&self) -> bool {
        self.stream_ended && self.is_quiescent()
    }

    pub fn config(&self) -> &EncoderControl {
        &self.control
    }

    pub fn coder(&self) -> &C {
        &self.coder
    }
}

impl<C: FrameCoder> Drop for Session<C> {
    fn drop(&mut self) {
        let states = std::mem::take(&mut self.states);

        for (index, state) in states.into_iter().enumerate() {
            if let Some(job) = state.pending_job {
                if let Err(e) = job.sync() {
                    log::warn!("discarding frame {} of slot {index}: {e}", state.frame_number);
                }
            }

            self.coder.finalize(state.slot);
        }
    }
}
