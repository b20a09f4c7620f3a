// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder configuration.
//!
//! [`Config`] is the user-facing, freely mutable set of options. Before a session is opened it is
//! turned into an [`EncoderControl`] by [`Config::validate`], which resolves the `auto` values and
//! rejects anything the pipeline cannot run with. The session and the coding subsystem only ever
//! read the [`EncoderControl`].

use thiserror::Error;

use crate::Resolution;

/// Largest supported overlapped-wavefront depth.
pub const MAX_OWF: usize = 32;

/// Largest quantization parameter.
pub const MAX_QP: u8 = 51;

/// Upper bound of an automatically chosen OWF depth.
const AUTO_OWF_LIMIT: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for option {name:?}")]
    InvalidValue { name: String, value: String },
    #[error("invalid input resolution {0}x{1}, dimensions must be even, non-zero and 16 bit")]
    InvalidResolution(u32, u32),
    #[error("qp {0} is out of range (0..={MAX_QP})")]
    InvalidQp(u8),
    #[error("owf {0} is out of range (0..={MAX_OWF})")]
    InvalidOwf(usize),
}

/// Options of an encoding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Luma width of the input pictures
    pub width: u32,
    /// Luma height of the input pictures
    pub height: u32,
    /// Quantization parameter shared by all frames
    pub qp: u8,
    /// Overlapped-wavefront depth, ie. the number of frames allowed in flight in addition to the
    /// current one. [`None`] picks a value from the thread count.
    pub owf: Option<usize>,
    /// Number of worker threads. `Some(0)` runs all encode jobs on the calling thread, [`None`]
    /// uses the available parallelism.
    pub threads: Option<usize>,
    /// Distance between intra frames. 0 means only the first frame is intra.
    pub intra_period: u32,
    /// Number of input pictures the coding subsystem buffers before it starts encoding.
    pub lookahead: usize,
    /// Select kernels using the detected CPU features.
    pub cpuid: bool,
    /// Offset of the first input frame, only used for logging.
    pub seek: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            qp: 32,
            owf: Some(0),
            threads: Some(0),
            intra_period: 0,
            lookahead: 0,
            cpuid: true,
            seek: 0,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid_value(name, value)),
    }
}

fn parse_auto<T: std::str::FromStr>(name: &str, value: &str) -> Result<Option<T>, ConfigError> {
    if value == "auto" {
        return Ok(None);
    }

    value
        .parse()
        .map(Some)
        .map_err(|_| invalid_value(name, value))
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid_value(name, value))
}

fn invalid_value(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.into(),
        value: value.into(),
    }
}

impl Config {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            ..Default::default()
        }
    }

    /// Sets a single option from its textual form, eg. `("owf", "auto")` or `("qp", "22")`.
    pub fn parse(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();

        match name {
            "width" => self.width = parse_num(name, value)?,
            "height" => self.height = parse_num(name, value)?,
            "input-res" => {
                let resolution: Resolution =
                    value.parse().map_err(|_| invalid_value(name, value))?;
                self.width = resolution.width;
                self.height = resolution.height;
            }
            "qp" => self.qp = parse_num(name, value)?,
            "owf" => self.owf = parse_auto(name, value)?,
            "threads" => self.threads = parse_auto(name, value)?,
            "period" | "intra-period" => self.intra_period = parse_num(name, value)?,
            "lookahead" => self.lookahead = parse_num(name, value)?,
            "cpuid" => self.cpuid = parse_bool(name, value)?,
            "seek" => self.seek = parse_num(name, value)?,
            _ => return Err(ConfigError::UnknownOption(name.into())),
        }

        log::trace!("config: {name}={value}");

        Ok(())
    }

    /// Resolves `auto` values and checks that the options describe a session that can be opened.
    pub fn validate(&self) -> Result<EncoderControl, ConfigError> {
        if self.width == 0
            || self.height == 0
            || self.width % 2 != 0
            || self.height % 2 != 0
            || self.width > u16::MAX as u32
            || self.height > u16::MAX as u32
        {
            return Err(ConfigError::InvalidResolution(self.width, self.height));
        }

        if self.qp > MAX_QP {
            return Err(ConfigError::InvalidQp(self.qp));
        }

        let threads = match self.threads {
            Some(threads) => threads,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let owf = match self.owf {
            Some(owf) => owf,
            None if threads == 0 => 0,
            None => threads.min(AUTO_OWF_LIMIT),
        };

        if owf > MAX_OWF {
            return Err(ConfigError::InvalidOwf(owf));
        }

        Ok(EncoderControl {
            resolution: Resolution::from((self.width, self.height)),
            qp: self.qp,
            owf,
            threads,
            intra_period: self.intra_period,
            lookahead: self.lookahead,
            cpuid: self.cpuid,
            seek: self.seek,
        })
    }
}

/// Validated, read-only configuration shared by the session and the coding subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderControl {
    pub resolution: Resolution,
    pub qp: u8,
    pub owf: usize,
    pub threads: usize,
    pub intra_period: u32,
    pub lookahead: usize,
    pub cpuid: bool,
    pub seek: u64,
}

impl EncoderControl {
    /// Number of encoder states in the pipeline ring.
    pub fn num_states(&self) -> usize {
        self.owf + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options() {
        let mut config = Config::default();

        config.parse("input-res", "64x32").unwrap();
        config.parse("qp", "22").unwrap();
        config.parse("owf", "3").unwrap();
        config.parse("threads", "auto").unwrap();
        config.parse("period", "8").unwrap();
        config.parse("cpuid", "no").unwrap();

        assert_eq!(config.width, 64);
        assert_eq!(config.height, 32);
        assert_eq!(config.qp, 22);
        assert_eq!(config.owf, Some(3));
        assert_eq!(config.threads, None);
        assert_eq!(config.intra_period, 8);
        assert!(!config.cpuid);
    }

    #[test]
    fn parse_rejects_garbage() {
        let mut config = Config::default();

        assert_eq!(
            config.parse("frobnicate", "1"),
            Err(ConfigError::UnknownOption("frobnicate".into()))
        );
        assert!(matches!(
            config.parse("qp", "high"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(config.parse("cpuid", "maybe").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn validate_resolves_auto_owf() {
        let mut config = Config::new(Resolution::from((64, 64)));

        config.owf = None;
        config.threads = Some(0);
        assert_eq!(config.validate().unwrap().owf, 0);

        config.threads = Some(2);
        assert_eq!(config.validate().unwrap().owf, 2);

        config.threads = Some(16);
        let control = config.validate().unwrap();
        assert_eq!(control.owf, AUTO_OWF_LIMIT);
        assert_eq!(control.num_states(), AUTO_OWF_LIMIT + 1);
    }

    #[test]
    fn validate_rejects_invalid() {
        let config = Config::default();
        assert_eq!(config.validate(), Err(ConfigError::InvalidResolution(0, 0)));

        let config = Config::new(Resolution::from((63, 64)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidResolution(63, 64))
        ));

        let mut config = Config::new(Resolution::from((64, 64)));
        config.qp = 52;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQp(52)));

        config.qp = 30;
        config.owf = Some(MAX_OWF + 1);
        assert_eq!(config.validate(), Err(ConfigError::InvalidOwf(MAX_OWF + 1)));
    }
}
