// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

use owfenc::Config;
use owfenc::Resolution;

/// Simple I420 to OWF encoder
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file, raw I420 frames
    #[argh(positional)]
    pub input: PathBuf,

    /// input frames width
    #[argh(option)]
    pub width: u32,

    /// input frames height
    #[argh(option)]
    pub height: u32,

    /// number of frames to encode, defaults to the whole input
    #[argh(option)]
    pub count: Option<usize>,

    /// quantization parameter
    #[argh(option, default = "32")]
    pub qp: u8,

    /// overlapped-wavefront depth, or "auto"
    #[argh(option, default = "String::from(\"auto\")")]
    pub owf: String,

    /// number of worker threads, or "auto"
    #[argh(option, default = "String::from(\"auto\")")]
    pub threads: String,

    /// pictures buffered before encoding starts
    #[argh(option, default = "0")]
    pub lookahead: usize,

    /// distance between intra frames, 0 for only the first one
    #[argh(option, default = "0")]
    pub period: u32,

    /// frames to skip at the start of the input
    #[argh(option, default = "0")]
    pub seek: u64,

    /// framerate written to the IVF header
    #[argh(option, default = "30")]
    pub framerate: u32,

    /// output file to write the IVF stream to
    #[argh(option)]
    pub output: Option<PathBuf>,

    /// output file to write the reconstructed I420 frames to
    #[argh(option)]
    pub recon: Option<PathBuf>,

    /// print the md5 of every reconstructed frame
    #[argh(switch)]
    pub compute_md5: bool,

    /// disable CPU specific kernels
    #[argh(switch)]
    pub no_cpuid: bool,
}

impl Args {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::new(self.resolution());

        config.qp = self.qp;
        config.lookahead = self.lookahead;
        config.intra_period = self.period;
        config.seek = self.seek;
        config.cpuid = !self.no_cpuid;
        config
            .parse("owf", &self.owf)
            .expect("invalid owf value");
        config
            .parse("threads", &self.threads)
            .expect("invalid threads value");

        config
    }
}
