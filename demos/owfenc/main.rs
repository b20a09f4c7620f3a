// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::sync::Arc;

use owfenc::bitstream::IvfFileHeader;
use owfenc::bitstream::IvfFrameHeader;
use owfenc::EncodedOutput;
use owfenc::Picture;

mod util;
use util::Args;

struct Sinks {
    output: Option<BufWriter<File>>,
    recon: Option<BufWriter<File>>,
    compute_md5: bool,
    frames: usize,
}

impl Sinks {
    fn write(&mut self, encoded: EncodedOutput) {
        if let Some(chunks) = encoded.chunks {
            if let Some(output) = &mut self.output {
                let pts = encoded
                    .picture
                    .as_ref()
                    .map_or(self.frames as i64, |picture| picture.pts);
                let hdr = IvfFrameHeader {
                    frame_size: chunks.total_len() as u32,
                    timestamp: pts as u64,
                };
                hdr.write_into(output).unwrap();
                for chunk in chunks {
                    output.write_all(&chunk).unwrap();
                }
            }
        }

        if let Some(picture) = encoded.picture {
            if self.compute_md5 {
                let mut data = Vec::with_capacity(Picture::i420_size(picture.resolution()));
                picture.write_i420(&mut data).unwrap();
                println!("{:x}", md5::compute(&data));
            }

            if let Some(recon) = &mut self.recon {
                picture.write_i420(recon).unwrap();
            }

            self.frames += 1;
        }
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let resolution = args.resolution();
    let frame_size = Picture::i420_size(resolution);

    let mut input = File::open(&args.input).expect("error opening input file");
    let available = input.metadata().map(|m| m.len()).unwrap_or(0) / frame_size as u64;
    let count = args
        .count
        .unwrap_or(available.saturating_sub(args.seek) as usize);
    input
        .seek(SeekFrom::Start(args.seek * frame_size as u64))
        .expect("error seeking input file");
    let mut input = BufReader::new(input);

    let mut session = owfenc::open(args.config()).expect("failed to open encoder");

    let mut output = args
        .output
        .as_ref()
        .map(|path| BufWriter::new(File::create(path).expect("error creating output file")));
    if let Some(output) = &mut output {
        let hdr = IvfFileHeader::new(
            resolution.width as u16,
            resolution.height as u16,
            args.framerate,
            count as u32,
        );
        hdr.write_into(output).unwrap();
    }

    let mut sinks = Sinks {
        output,
        recon: args
            .recon
            .as_ref()
            .map(|path| BufWriter::new(File::create(path).expect("error creating recon file"))),
        compute_md5: args.compute_md5,
        frames: 0,
    };

    let mut buf = vec![0u8; frame_size];
    for i in 0..count {
        if input.read_exact(&mut buf).is_err() {
            log::warn!("input ended after {i} frames");
            break;
        }

        let picture = Picture::from_i420(resolution, &buf, i as i64)
            .expect("frame buffer does not match the resolution");
        sinks.write(session.encode(Some(Arc::new(picture))).unwrap());
    }

    while !session.is_flushed() {
        sinks.write(session.encode(None).unwrap());
    }

    // The input may have been shorter than announced.
    if let Some(output) = &mut sinks.output {
        let hdr = IvfFileHeader::new(
            resolution.width as u16,
            resolution.height as u16,
            args.framerate,
            sinks.frames as u32,
        );
        output.seek(SeekFrom::Start(0)).unwrap();
        hdr.write_into(output).unwrap();
        output.flush().unwrap();
    }

    log::info!(
        "encoded {} frames with {} slots",
        sinks.frames,
        session.num_slots()
    );

    session.close();
}
