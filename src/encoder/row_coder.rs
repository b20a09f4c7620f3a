// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Default coding subsystem.
//!
//! Pictures are coded in rows of [`CTU_SIZE`] luma lines. Every row is a separate job which
//! depends on the row above it in the same frame and, for inter frames, on the rows of the
//! previous frame covering its motion search window. The previous frame does not have to be
//! finished for the top rows of the next one to start: this is the overlapped wavefront that makes
//! keeping several frames in flight worthwhile. A last job per frame waits for all rows and
//! assembles the reconstruction and the frame chunk; its handle is the job the session waits on.
//!
//! Block coding is deliberately simple: each [`BLOCK_WIDTH`] wide column of a row is predicted
//! either vertically from the line above or from the previous frame with a vertical displacement,
//! whichever has the lower SAD, and the residual is quantized with a QP derived step.

use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::bitstream::BitWriter;
use crate::bitstream::Bitstream;
use crate::config::EncoderControl;
use crate::encoder::CodedFrame;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::FrameCoder;
use crate::picture::Picture;
use crate::picture::NUM_PLANES;
use crate::picture::Y_PLANE;
use crate::strategy::Strategies;
use crate::syntax::FrameHeader;
use crate::syntax::FrameType;
use crate::syntax::SequenceHeader;
use crate::threadqueue::Dep;
use crate::threadqueue::JobError;
use crate::threadqueue::JobHandle;
use crate::threadqueue::JobResult;
use crate::threadqueue::ThreadQueue;
use crate::Resolution;

/// Luma lines per row job
pub const CTU_SIZE: usize = 16;
/// Width of a prediction block, in samples of the coded plane
pub const BLOCK_WIDTH: usize = 8;
/// Largest vertical displacement searched for luma, halved for chroma
pub const SEARCH_RANGE: usize = 4;

/// Prediction used above the first line of a picture.
pub(crate) const NEUTRAL: u8 = 0x80;

/// Quantization step of `qp`, doubling every 6 steps. QPs up to 4 are lossless.
pub fn qstep(qp: u8) -> u32 {
    2f64.powf((qp as f64 - 4.0) / 6.0).round().max(1.0) as u32
}

/// Lines of `plane` covered by one row.
pub(crate) fn band_height(plane: usize) -> usize {
    if plane == Y_PLANE {
        CTU_SIZE
    } else {
        CTU_SIZE / 2
    }
}

fn search_range(plane: usize) -> isize {
    if plane == Y_PLANE {
        SEARCH_RANGE as isize
    } else {
        (SEARCH_RANGE / 2) as isize
    }
}

fn num_rows(resolution: Resolution) -> usize {
    (resolution.height as usize + CTU_SIZE - 1) / CTU_SIZE
}

fn job_failed(e: impl std::fmt::Display) -> JobError {
    JobError::Failed(e.to_string())
}

/// Output of a row job.
pub struct CodedRow {
    index: usize,
    /// Reconstructed lines of each plane covered by the row
    planes: [Vec<u8>; NUM_PLANES],
    payload: Bytes,
}

impl CodedRow {
    fn last_line(&self, plane: usize, width: usize) -> &[u8] {
        let lines = &self.planes[plane];
        &lines[lines.len() - width..]
    }
}

type RowJob = JobHandle<Arc<CodedRow>>;

/// Parameters shared by all jobs of a frame.
struct FrameParams {
    frame_number: u64,
    frame_type: FrameType,
    qp: u8,
    step: u32,
    resolution: Resolution,
    owf: usize,
    strategies: &'static Strategies,
}

/// The previous frame's reconstruction, seen through the rows a row job depends on.
struct ReferenceView<'a> {
    rows: &'a [Arc<CodedRow>],
    first: usize,
    widths: [usize; NUM_PLANES],
    heights: [usize; NUM_PLANES],
}

impl<'a> ReferenceView<'a> {
    fn new(rows: &'a [Arc<CodedRow>], input: &Picture) -> Option<Self> {
        let first = rows.first()?.index;

        Some(Self {
            rows,
            first,
            widths: [0, 1, 2].map(|plane| input.plane_width(plane)),
            heights: [0, 1, 2].map(|plane| input.plane_height(plane)),
        })
    }

    /// Line `y` of `plane`, clamped to the picture and to the rows available.
    fn line(&self, plane: usize, y: isize) -> &[u8] {
        let band = band_height(plane);
        let top = self.first * band;
        let bottom = ((self.first + self.rows.len()) * band).min(self.heights[plane]);
        let y = (y.max(0) as usize).clamp(top, bottom - 1);

        let row = &self.rows[y / band - self.first];
        let width = self.widths[plane];
        let offset = (y % band) * width;

        &row.planes[plane][offset..offset + width]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockMode {
    Intra,
    Inter { dy: isize },
}

/// Picks the prediction of the block at columns `x` and lines `y` of `plane` with the lowest SAD.
/// Intra cost is estimated on source lines since the reconstruction does not exist yet.
fn choose_mode(
    params: &FrameParams,
    input: &Picture,
    plane: usize,
    x: &std::ops::Range<usize>,
    y: &std::ops::Range<usize>,
    above: &[u8],
    reference: Option<&ReferenceView>,
) -> BlockMode {
    let sad = params.strategies.sad;

    let mut best_cost = 0;
    for line in y.clone() {
        let pred = if line == y.start {
            above
        } else {
            &input.line(plane, line - 1)[x.clone()]
        };
        best_cost += sad(&input.line(plane, line)[x.clone()], pred);
    }
    let mut best = BlockMode::Intra;

    let Some(reference) = reference else {
        return best;
    };

    let range = search_range(plane);
    for dy in -range..=range {
        let cost: u32 = y
            .clone()
            .map(|line| {
                let pred = &reference.line(plane, line as isize + dy)[x.clone()];
                sad(&input.line(plane, line)[x.clone()], pred)
            })
            .sum();

        if cost < best_cost {
            best_cost = cost;
            best = BlockMode::Inter { dy };
        }
    }

    best
}

fn code_row(
    params: &FrameParams,
    input: &Picture,
    index: usize,
    above: Option<&CodedRow>,
    refs: &[Arc<CodedRow>],
) -> JobResult<CodedRow> {
    let reference = ReferenceView::new(refs, input);
    let neutral = [NEUTRAL; BLOCK_WIDTH];

    let mut planes: [Vec<u8>; NUM_PLANES] = Default::default();
    let mut payload = Vec::new();
    let mut levels = [0i32; BLOCK_WIDTH];

    {
        let mut writer = BitWriter::new(&mut payload);

        for plane in 0..NUM_PLANES {
            let width = input.plane_width(plane);
            let y0 = index * band_height(plane);
            let y1 = (y0 + band_height(plane)).min(input.plane_height(plane));
            if y0 >= y1 {
                continue;
            }

            let mut recon = vec![0u8; (y1 - y0) * width];
            let above_line = above.map(|row| row.last_line(plane, width));

            for x0 in (0..width).step_by(BLOCK_WIDTH) {
                let x = x0..(x0 + BLOCK_WIDTH).min(width);
                let n = x.len();
                let above_block = above_line.map_or(&neutral[..n], |line| &line[x.clone()]);

                let mode = choose_mode(
                    params,
                    input,
                    plane,
                    &x,
                    &(y0..y1),
                    above_block,
                    reference.as_ref(),
                );

                match mode {
                    BlockMode::Intra => writer.write_bit(false).map_err(job_failed)?,
                    BlockMode::Inter { dy } => {
                        writer.write_bit(true).map_err(job_failed)?;
                        writer.write_se(dy as i32).map_err(job_failed)?;
                    }
                }

                for y in y0..y1 {
                    let line = y - y0;
                    let (coded, rest) = recon.split_at_mut(line * width);

                    let pred = match (mode, &reference) {
                        (BlockMode::Intra, _) if line == 0 => above_block,
                        (BlockMode::Intra, _) => &coded[(line - 1) * width..][x.clone()],
                        (BlockMode::Inter { dy }, Some(reference)) => {
                            &reference.line(plane, y as isize + dy)[x.clone()]
                        }
                        (BlockMode::Inter { .. }, None) => {
                            return Err(job_failed("inter block without reference"))
                        }
                    };

                    (params.strategies.quantize)(
                        &input.line(plane, y)[x.clone()],
                        pred,
                        params.step,
                        &mut levels[..n],
                        &mut rest[x.clone()],
                    );

                    for &level in &levels[..n] {
                        writer.write_se(level).map_err(job_failed)?;
                    }
                }
            }

            planes[plane] = recon;
        }

        writer.flush().map_err(job_failed)?;
    }

    Ok(CodedRow {
        index,
        planes,
        payload: Bytes::from(payload),
    })
}

fn write_frame(params: &FrameParams, pts: i64, rows: &[RowJob]) -> JobResult<CodedFrame> {
    let rows = rows
        .iter()
        .map(JobHandle::wait)
        .collect::<JobResult<Vec<_>>>()?;

    let mut recon = Picture::new(params.resolution);
    recon.pts = pts;
    for row in &rows {
        for plane in 0..NUM_PLANES {
            let start = row.index * band_height(plane) * recon.plane_width(plane);
            let lines = &row.planes[plane];
            recon.plane_mut(plane)[start..start + lines.len()].copy_from_slice(lines);
        }
    }

    let mut bitstream = Bitstream::new();

    if params.frame_number == 0 {
        let mut header = Vec::new();
        SequenceHeader {
            resolution: params.resolution,
            qp: params.qp,
            owf: params.owf as u8,
        }
        .write_into(&mut BitWriter::new(&mut header))
        .map_err(job_failed)?;
        bitstream.push_chunk(header);
    }

    let mut header = Vec::new();
    FrameHeader {
        frame_number: u32::try_from(params.frame_number).map_err(job_failed)?,
        frame_type: params.frame_type,
        qp: params.qp,
        num_rows: rows.len() as u32,
    }
    .write_into(&mut BitWriter::new(&mut header))
    .map_err(job_failed)?;

    let payload_len: usize = rows.iter().map(|row| row.payload.len()).sum();
    let mut chunk = BytesMut::with_capacity(header.len() + 4 * rows.len() + payload_len);
    chunk.put_slice(&header);
    for row in &rows {
        chunk.put_u32(row.payload.len() as u32);
    }
    for row in &rows {
        chunk.put_slice(&row.payload);
    }
    bitstream.push_chunk(chunk.freeze());

    log::trace!(
        "frame {} written: {:?}, {} bytes",
        params.frame_number,
        params.frame_type,
        bitstream.len()
    );

    Ok(CodedFrame {
        frame_number: params.frame_number,
        recon: Arc::new(recon),
        bitstream,
    })
}

/// Working data of one encoder state.
pub struct RowSlot {
    index: usize,
    qp: u8,
    frame_number: u64,
    /// Picture to code, set by a successful feed
    input: Option<Arc<Picture>>,
    /// Slot holding the previous frame, set when linked
    previous: Option<usize>,
    /// Row jobs of the last frame started in this slot, referenced by the next frame
    rows: Vec<RowJob>,
}

pub struct RowCoder {
    control: EncoderControl,
    strategies: &'static Strategies,
    num_rows: usize,
    /// For every row, the rows of the previous frame inside its search window
    reference_rows: Vec<RangeInclusive<usize>>,
    lookahead: VecDeque<Arc<Picture>>,
    queue: ThreadQueue,
}

impl RowCoder {
    pub fn new(control: &EncoderControl, strategies: &'static Strategies) -> EncodeResult<Self> {
        let queue = ThreadQueue::new(control.threads).map_err(anyhow::Error::from)?;

        let num_rows = num_rows(control.resolution);
        let reference_rows = (0..num_rows)
            .map(|row| row.saturating_sub(1)..=(row + 1).min(num_rows - 1))
            .collect();

        Ok(Self {
            control: control.clone(),
            strategies,
            num_rows,
            reference_rows,
            lookahead: Default::default(),
            queue,
        })
    }

    fn frame_type(&self, frame_number: u64) -> FrameType {
        let period = self.control.intra_period as u64;

        if frame_number == 0 || (period > 0 && frame_number % period == 0) {
            FrameType::Intra
        } else {
            FrameType::Inter
        }
    }
}

impl FrameCoder for RowCoder {
    type Slot = RowSlot;
    type Job = JobHandle<CodedFrame>;

    fn init_slot(&mut self, index: usize) -> EncodeResult<RowSlot> {
        Ok(RowSlot {
            index,
            qp: self.control.qp,
            frame_number: 0,
            input: None,
            previous: None,
            rows: Vec::new(),
        })
    }

    fn link_previous(
        &mut self,
        slot: &mut RowSlot,
        previous: Option<&RowSlot>,
    ) -> EncodeResult<()> {
        let previous = previous.map_or(slot.index, |previous| previous.index);
        slot.previous = Some(previous);

        log::trace!("slot {} references slot {previous}", slot.index);

        Ok(())
    }

    fn prepare(&mut self, slot: &mut RowSlot, frame_number: u64) -> EncodeResult<()> {
        slot.frame_number = frame_number;
        slot.input = None;

        Ok(())
    }

    fn feed(&mut self, slot: &mut RowSlot, picture: Option<Arc<Picture>>) -> EncodeResult<bool> {
        let draining = picture.is_none();

        if let Some(picture) = picture {
            if picture.resolution() != self.control.resolution {
                return Err(anyhow!(
                    "picture resolution {:?} does not match the configured {:?}",
                    picture.resolution(),
                    self.control.resolution
                )
                .into());
            }

            self.lookahead.push_back(picture);
        }

        let ready = if draining {
            !self.lookahead.is_empty()
        } else {
            self.lookahead.len() > self.control.lookahead
        };

        if !ready {
            log::trace!("{} pictures in lookahead", self.lookahead.len());
            return Ok(false);
        }

        slot.input = self.lookahead.pop_front();

        Ok(true)
    }

    fn submit(
        &mut self,
        slot: &mut RowSlot,
        previous: Option<&RowSlot>,
    ) -> EncodeResult<JobHandle<CodedFrame>> {
        let frame_type = self.frame_type(slot.frame_number);

        let reference = match previous {
            Some(previous) => previous.rows.clone(),
            None => slot.rows.clone(),
        };

        let previous_index = previous.map_or(slot.index, |previous| previous.index);
        if slot.previous != Some(previous_index) {
            log::error!(
                "slot {} linked to {:?} but started after slot {previous_index}",
                slot.index,
                slot.previous
            );
            return Err(EncodeError::InvalidInternalState);
        }

        if frame_type == FrameType::Inter && reference.len() != self.num_rows {
            log::error!(
                "slot {} cannot start frame {}: {} reference rows for {} rows",
                slot.index,
                slot.frame_number,
                reference.len(),
                self.num_rows
            );
            return Err(EncodeError::InvalidInternalState);
        }

        let input = slot.input.take().ok_or(EncodeError::InvalidInternalState)?;

        let params = Arc::new(FrameParams {
            frame_number: slot.frame_number,
            frame_type,
            qp: slot.qp,
            step: qstep(slot.qp),
            resolution: self.control.resolution,
            owf: self.control.owf,
            strategies: self.strategies,
        });

        let mut rows: Vec<RowJob> = Vec::with_capacity(self.num_rows);
        for (index, window) in self.reference_rows.iter().enumerate() {
            let above = rows.last().cloned();
            let refs = match frame_type {
                FrameType::Inter => reference[window.clone()].to_vec(),
                FrameType::Intra => Vec::new(),
            };
            let deps: Vec<Dep> = above.iter().chain(refs.iter()).map(JobHandle::dep).collect();

            let params = Arc::clone(&params);
            let input = Arc::clone(&input);
            rows.push(self.queue.submit(deps, move || {
                let above = above.map(|row| row.wait()).transpose()?;
                let refs = refs
                    .iter()
                    .map(JobHandle::wait)
                    .collect::<JobResult<Vec<_>>>()?;

                code_row(&params, &input, index, above.as_deref(), &refs).map(Arc::new)
            }));
        }

        let pts = input.pts;
        let frame_rows = rows.clone();
        let deps: Vec<Dep> = rows.iter().map(JobHandle::dep).collect();
        let job = self
            .queue
            .submit(deps, move || write_frame(&params, pts, &frame_rows));

        log::trace!(
            "slot {} submitted frame {} ({:?}) as {} row jobs",
            slot.index,
            slot.frame_number,
            frame_type,
            rows.len()
        );

        slot.rows = rows;

        Ok(job)
    }

    fn finalize(&mut self, slot: RowSlot) {
        log::trace!(
            "finalizing slot {} ({} row jobs held)",
            slot.index,
            slot.rows.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use bitreader::BitReader;

    use super::*;
    use crate::config::Config;
    use crate::encoder::session::Session;
    use crate::strategy;
    use crate::syntax::parse_sequence_header;
    use crate::syntax::read_se;
    use crate::syntax::split_frame;

    const WIDTH: u32 = 40;
    const HEIGHT: u32 = 36;

    /// Diagonal gradient with a bright square moving down by two lines per frame.
    fn test_picture(frame: usize) -> Arc<Picture> {
        let mut picture = Picture::new(Resolution::from((WIDTH, HEIGHT)));
        picture.pts = frame as i64 * 10;

        for plane in 0..NUM_PLANES {
            let width = picture.plane_width(plane);
            let scale = if plane == Y_PLANE { 1 } else { 2 };
            for (i, sample) in picture.plane_mut(plane).iter_mut().enumerate() {
                let (x, y) = ((i % width) * scale, (i / width) * scale);
                let in_square = (8..20).contains(&x) && (2 * frame..2 * frame + 12).contains(&y);
                *sample = if in_square {
                    230
                } else {
                    ((x * 3 + y * 5 + plane * 40) % 200) as u8
                };
            }
        }

        Arc::new(picture)
    }

    fn encode_all(config: Config, frames: usize) -> (Vec<Arc<Picture>>, Vec<Bytes>) {
        let mut session = crate::open(config).unwrap();
        let mut recon = Vec::new();
        let mut chunks = Vec::new();

        let inputs = (0..frames).map(|i| Some(test_picture(i)));
        for input in inputs.chain(std::iter::repeat(None).take(frames + 2)) {
            let output = session.encode(input).unwrap();
            recon.extend(output.picture);
            chunks.extend(output.chunks.into_iter().flatten());
        }

        assert!(session.is_quiescent());
        (recon, chunks)
    }

    /// Decodes a stream the way the row jobs reconstruct it, using whole pictures as reference.
    fn decode(chunks: &[Bytes]) -> Vec<Picture> {
        let sequence = parse_sequence_header(&chunks[0]).unwrap();
        let mut decoded: Vec<Picture> = Vec::new();

        for chunk in &chunks[1..] {
            let (header, rows) = split_frame(chunk).unwrap();
            let step = qstep(header.qp) as i32;
            let mut picture = Picture::new(sequence.resolution);

            for (index, payload) in rows.iter().enumerate() {
                let mut r = BitReader::new(payload);

                for plane in 0..NUM_PLANES {
                    let width = picture.plane_width(plane);
                    let height = picture.plane_height(plane);
                    let y0 = index * band_height(plane);
                    let y1 = (y0 + band_height(plane)).min(height);

                    for x0 in (0..width).step_by(BLOCK_WIDTH) {
                        let dy = match r.read_bool().unwrap() {
                            true => Some(read_se(&mut r).unwrap() as isize),
                            false => None,
                        };

                        for y in y0..y1 {
                            for x in x0..(x0 + BLOCK_WIDTH).min(width) {
                                let pred = match dy {
                                    None if y == 0 => NEUTRAL,
                                    None => picture.plane(plane)[(y - 1) * width + x],
                                    Some(dy) => {
                                        let previous = decoded.last().unwrap();
                                        let y = (y as isize + dy).clamp(0, height as isize - 1);
                                        previous.plane(plane)[y as usize * width + x]
                                    }
                                };
                                let level = read_se(&mut r).unwrap();
                                picture.plane_mut(plane)[y * width + x] =
                                    (pred as i32 + level * step).clamp(0, 255) as u8;
                            }
                        }
                    }
                }
            }

            decoded.push(picture);
        }

        decoded
    }

    fn config(owf: usize, threads: usize, qp: u8) -> Config {
        let mut config = Config::new(Resolution::from((WIDTH, HEIGHT)));
        config.owf = Some(owf);
        config.threads = Some(threads);
        config.qp = qp;
        config
    }

    #[test]
    fn lossless_at_low_qp() {
        let (recon, chunks) = encode_all(config(1, 2, 0), 4);

        assert_eq!(recon.len(), 4);
        for (i, picture) in recon.iter().enumerate() {
            assert_eq!(picture.as_ref(), test_picture(i).as_ref());
        }

        // Sequence header plus one chunk per frame.
        assert_eq!(chunks.len(), 5);
    }

    #[test]
    fn stream_decodes_to_reconstruction() {
        let (recon, chunks) = encode_all(config(2, 3, 30), 6);

        let decoded = decode(&chunks);
        assert_eq!(decoded.len(), recon.len());
        for (decoded, recon) in decoded.iter().zip(&recon) {
            assert_eq!(decoded.crc32(), recon.crc32());
        }
    }

    #[test]
    fn output_independent_of_overlap() {
        let (serial_recon, serial_chunks) = encode_all(config(0, 0, 27), 5);
        let (overlapped_recon, overlapped_chunks) = encode_all(config(3, 4, 27), 5);

        assert_eq!(serial_recon, overlapped_recon);

        // Only the owf field of the sequence header differs.
        let serial_header = parse_sequence_header(&serial_chunks[0]).unwrap();
        let overlapped_header = parse_sequence_header(&overlapped_chunks[0]).unwrap();
        assert_eq!(serial_header.owf, 0);
        assert_eq!(overlapped_header.owf, 3);
        assert_eq!(serial_chunks[1..], overlapped_chunks[1..]);
    }

    #[test]
    fn intra_period_resets_prediction() {
        let mut config = config(1, 2, 22);
        config.intra_period = 2;
        let (_, chunks) = encode_all(config, 5);

        let types: Vec<FrameType> = chunks[1..]
            .iter()
            .map(|chunk| split_frame(chunk).unwrap().0.frame_type)
            .collect();

        assert_eq!(
            types,
            vec![
                FrameType::Intra,
                FrameType::Inter,
                FrameType::Intra,
                FrameType::Inter,
                FrameType::Intra
            ]
        );
    }

    #[test]
    fn lookahead_delays_start() {
        let mut config = config(1, 1, 32);
        config.lookahead = 2;
        let mut session = crate::open(config).unwrap();

        for i in 0..2 {
            let output = session.encode(Some(test_picture(i))).unwrap();
            assert!(output.picture.is_none());
            assert_eq!(session.frames_started(), 0);
        }

        session.encode(Some(test_picture(2))).unwrap();
        assert_eq!(session.frames_started(), 1);

        let mut pts = Vec::new();
        for _ in 0..6 {
            pts.extend(session.encode(None).unwrap().picture.map(|p| p.pts));
        }
        assert_eq!(pts, vec![0, 10, 20]);
        assert!(session.is_quiescent());
    }

    #[test]
    fn rejects_wrong_resolution() {
        let mut session = crate::open(config(0, 0, 32)).unwrap();
        let picture = Arc::new(Picture::new(Resolution::from((WIDTH, HEIGHT + 2))));

        assert!(matches!(
            session.encode(Some(picture)),
            Err(EncodeError::Other(_))
        ));
    }

    #[test]
    fn submit_requires_link() {
        let control = config(0, 0, 32).validate().unwrap();
        let strategies = strategy::init(false).unwrap();
        let mut coder = RowCoder::new(&control, strategies).unwrap();

        let mut slot = coder.init_slot(0).unwrap();
        coder.prepare(&mut slot, 0).unwrap();
        assert!(coder.feed(&mut slot, Some(test_picture(0))).unwrap());
        assert!(matches!(
            coder.submit(&mut slot, None),
            Err(EncodeError::InvalidInternalState)
        ));

        coder.finalize(slot);

        let session = Session::new(control, coder).unwrap();
        assert_eq!(session.num_slots(), 1);
    }

    #[test]
    fn submit_checks_linked_predecessor() {
        let control = config(2, 0, 32).validate().unwrap();
        let strategies = strategy::init(false).unwrap();
        let mut coder = RowCoder::new(&control, strategies).unwrap();

        let first = coder.init_slot(0).unwrap();
        let mut second = coder.init_slot(1).unwrap();
        let third = coder.init_slot(2).unwrap();
        coder.link_previous(&mut second, Some(&first)).unwrap();

        coder.prepare(&mut second, 0).unwrap();
        assert!(coder.feed(&mut second, Some(test_picture(0))).unwrap());
        assert!(matches!(
            coder.submit(&mut second, Some(&third)),
            Err(EncodeError::InvalidInternalState)
        ));

        let coded = coder.submit(&mut second, Some(&first)).unwrap().take().unwrap();
        assert_eq!(coded.frame_number, 0);
        assert_eq!(coded.recon.pts, 0);

        for slot in [first, second, third] {
            coder.finalize(slot);
        }
    }

    #[test]
    fn drain_until_flushed_empties_lookahead() {
        for (owf, fed) in [(0, 5), (2, 2), (1, 1)] {
            let mut config = config(owf, 0, 32);
            config.lookahead = 2;
            let mut session = crate::open(config).unwrap();

            let mut pts = Vec::new();
            for i in 0..fed {
                pts.extend(session.encode(Some(test_picture(i))).unwrap().picture.map(|p| p.pts));
            }

            let mut calls = 0;
            while !session.is_flushed() {
                pts.extend(session.encode(None).unwrap().picture.map(|p| p.pts));
                calls += 1;
                assert!(calls <= fed + owf + 2);
            }

            let expected: Vec<i64> = (0..fed as i64).map(|i| i * 10).collect();
            assert_eq!(pts, expected, "owf {owf}, fed {fed}");
        }
    }

    #[test]
    fn qstep_doubles_every_six() {
        assert_eq!(qstep(0), 1);
        assert_eq!(qstep(4), 1);
        assert_eq!(qstep(22), 8);
        assert_eq!(qstep(28), 16);
    }
}
