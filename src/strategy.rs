// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide selection of pixel kernels.
//!
//! [`init`] picks an implementation of every kernel for the CPU the process runs on and checks it
//! against the generic implementation before handing out the table. It is meant to be called once
//! before the first session is opened; later calls return the table selected by the first
//! successful one. The resulting `&'static Strategies` is passed explicitly to whoever needs it.

use std::sync::OnceLock;

use thiserror::Error;

/// Sum of absolute differences of two equally sized blocks.
pub type SadFn = fn(&[u8], &[u8]) -> u32;

/// Quantizes `src - pred` with `step`, writes the levels and the reconstruction.
pub type QuantizeFn = fn(src: &[u8], pred: &[u8], step: u32, levels: &mut [i32], recon: &mut [u8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelLevel {
    Generic,
    /// Lane-chunked loops the compiler can vectorize with the baseline instruction set
    Chunked,
    /// The chunked kernels compiled with AVX2 enabled. There are no hand written AVX2 kernels.
    #[cfg(target_arch = "x86_64")]
    Avx2,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("{kernel} kernel for {level:?} does not match the generic implementation")]
    SelfCheck {
        kernel: &'static str,
        level: KernelLevel,
    },
}

/// Features of the running CPU that influence kernel selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    pub sse4_1: bool,
    pub avx2: bool,
    pub neon: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            Self {
                sse4_1: is_x86_feature_detected!("sse4.1"),
                avx2: is_x86_feature_detected!("avx2"),
                neon: false,
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            Self {
                neon: std::arch::is_aarch64_feature_detected!("neon"),
                ..Default::default()
            }
        }

        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Self::default()
        }
    }

    fn best_level(&self) -> KernelLevel {
        #[cfg(target_arch = "x86_64")]
        if self.avx2 {
            return KernelLevel::Avx2;
        }

        if self.sse4_1 || self.neon {
            KernelLevel::Chunked
        } else {
            KernelLevel::Generic
        }
    }
}

/// Table of the selected kernels.
#[derive(Debug, Clone, Copy)]
pub struct Strategies {
    pub level: KernelLevel,
    pub sad: SadFn,
    pub quantize: QuantizeFn,
}

/// Kernels that work everywhere. Usable without [`init`].
pub static GENERIC: Strategies = Strategies {
    level: KernelLevel::Generic,
    sad: sad_generic,
    quantize: quantize_generic,
};

static SELECTED: OnceLock<Strategies> = OnceLock::new();

impl Strategies {
    fn for_level(level: KernelLevel) -> Self {
        match level {
            KernelLevel::Generic => GENERIC,
            KernelLevel::Chunked => Self {
                level,
                sad: sad_chunked,
                quantize: quantize_generic,
            },
            #[cfg(target_arch = "x86_64")]
            KernelLevel::Avx2 => Self {
                level,
                sad: sad_avx2,
                quantize: quantize_generic,
            },
        }
    }

    /// Compares every kernel with its generic counterpart on a fixed pseudo-random input.
    fn self_check(&self) -> Result<(), StrategyError> {
        let mut seed = 0x2545_f491u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed >> 24) as u8
        };

        // Odd length so the chunked loops also exercise their remainder.
        let a: Vec<u8> = (0..67).map(|_| next()).collect();
        let b: Vec<u8> = (0..67).map(|_| next()).collect();

        if (self.sad)(&a, &b) != sad_generic(&a, &b) {
            return Err(StrategyError::SelfCheck {
                kernel: "sad",
                level: self.level,
            });
        }

        let mut levels = [vec![0; a.len()], vec![0; a.len()]];
        let mut recon = [vec![0; a.len()], vec![0; a.len()]];
        let [levels0, levels1] = &mut levels;
        let [recon0, recon1] = &mut recon;
        (self.quantize)(&a, &b, 7, levels0, recon0);
        quantize_generic(&a, &b, 7, levels1, recon1);
        if levels0 != levels1 || recon0 != recon1 {
            return Err(StrategyError::SelfCheck {
                kernel: "quantize",
                level: self.level,
            });
        }

        Ok(())
    }
}

/// Selects the process-wide kernels. With `use_cpuid` unset the generic kernels are used.
pub fn init(use_cpuid: bool) -> Result<&'static Strategies, StrategyError> {
    if let Some(strategies) = SELECTED.get() {
        return Ok(strategies);
    }

    let level = if use_cpuid {
        let features = CpuFeatures::detect();
        log::debug!("detected cpu features: {features:?}");
        features.best_level()
    } else {
        KernelLevel::Generic
    };

    let strategies = Strategies::for_level(level);
    strategies.self_check()?;

    let selected = SELECTED.get_or_init(|| strategies);
    log::debug!("selected {:?} kernels", selected.level);

    Ok(selected)
}

fn sad_generic(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| a.abs_diff(b) as u32)
        .sum()
}

fn sad_chunked(a: &[u8], b: &[u8]) -> u32 {
    const LANES: usize = 16;

    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    let mut acc = [0u32; LANES];
    let mut a_chunks = a.chunks_exact(LANES);
    let mut b_chunks = b.chunks_exact(LANES);
    for (a, b) in a_chunks.by_ref().zip(b_chunks.by_ref()) {
        for lane in 0..LANES {
            acc[lane] += a[lane].abs_diff(b[lane]) as u32;
        }
    }

    acc.iter().sum::<u32>() + sad_generic(a_chunks.remainder(), b_chunks.remainder())
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn sad_avx2_inner(a: &[u8], b: &[u8]) -> u32 {
    sad_chunked(a, b)
}

#[cfg(target_arch = "x86_64")]
fn sad_avx2(a: &[u8], b: &[u8]) -> u32 {
    // SAFETY: only selected by `init` after avx2 was detected.
    unsafe { sad_avx2_inner(a, b) }
}

fn quantize_generic(src: &[u8], pred: &[u8], step: u32, levels: &mut [i32], recon: &mut [u8]) {
    let step = step.max(1) as i32;

    for (((&src, &pred), level), recon) in src.iter().zip(pred).zip(levels).zip(recon) {
        let residual = src as i32 - pred as i32;
        let magnitude = (residual.abs() + step / 2) / step;
        *level = if residual < 0 { -magnitude } else { magnitude };
        *recon = (pred as i32 + *level * step).clamp(0, u8::MAX as i32) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init(true).unwrap();
        let second = init(false).unwrap();

        assert!(std::ptr::eq(first, second));
        assert_eq!(first.level, second.level);
    }

    #[test]
    fn every_level_passes_self_check() {
        let features = CpuFeatures::detect();

        Strategies::for_level(KernelLevel::Generic).self_check().unwrap();
        Strategies::for_level(KernelLevel::Chunked).self_check().unwrap();
        Strategies::for_level(features.best_level()).self_check().unwrap();
    }

    #[test]
    fn sad_kernels_agree() {
        let a: Vec<u8> = (0..=255).collect();
        let b: Vec<u8> = (0..=255).rev().collect();

        assert_eq!(sad_generic(&a, &a), 0);
        assert_eq!(sad_chunked(&a, &b), sad_generic(&a, &b));
        assert_eq!(sad_chunked(&a[..5], &b[..5]), sad_generic(&a[..5], &b[..5]));
    }

    #[test]
    fn quantize_reconstructs_within_half_step() {
        let src = [0u8, 10, 100, 200, 255];
        let pred = [128u8; 5];
        let mut levels = [0; 5];
        let mut recon = [0u8; 5];

        quantize_generic(&src, &pred, 8, &mut levels, &mut recon);

        assert_eq!(levels, [-16, -15, -4, 9, 16]);
        for (src, recon) in src.iter().zip(recon) {
            assert!(src.abs_diff(recon) <= 4, "{src} vs {recon}");
        }
    }
}
