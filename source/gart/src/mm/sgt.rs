// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scatter-gather tables.
//!
//! An [`Sgt`] presents a uniform, chip-independent view of the physical
//! segments backing one allocation. The physical-only variant describes a
//! single contiguous run and shares the owning descriptor's lifetime; the
//! OS-list variant carries per-segment DMA addresses and, on virtualized
//! systems, an intermediate-physical-address translation hook.

use crate::device::Gpu;
use crate::mm::gmmu::GmmuAttrs;

/// One contiguous run of backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgtSegment {
    /// Physical address of the run.
    pub phys: u64,
    /// DMA-visible address; equals `phys` unless an IOMMU remapped it.
    pub dma: u64,
    /// Intermediate physical address (virtualized OSes); equals `phys`
    /// on bare metal.
    pub ipa: u64,
    /// Length of the run in bytes.
    pub length: u64,
}

impl SgtSegment {
    /// Segment for a contiguous physical run with identity dma/ipa.
    pub fn contiguous(phys: u64, length: u64) -> SgtSegment {
        SgtSegment { phys, dma: phys, ipa: phys, length }
    }
}

/// Translation hook resolving an intermediate physical address to the
/// largest contiguous physical run starting there.
pub type IpaTranslate = dyn Fn(u64, &mut u64) -> u64 + Send + Sync;

enum SgtBacking {
    /// Single-run physical mapping; the chain is owned by the memory
    /// descriptor, so dropping the SGT releases nothing else.
    Phys,
    /// OS scatter-list; may be IOMMU-routed and may carry an IPA
    /// translation on virtualized systems.
    OsList { iommuable: bool, ipa_translate: Option<Box<IpaTranslate>> },
}

/// Polymorphic segment sequence backing one allocation.
pub struct Sgt {
    segments: Vec<SgtSegment>,
    backing: SgtBacking,
}

impl std::fmt::Debug for Sgt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sgt")
            .field("segments", &self.segments)
            .field("iommuable", &self.iommuable())
            .finish()
    }
}

impl Sgt {
    /// Single-segment SGT over a contiguous physical run.
    pub fn from_phys(phys: u64, length: u64) -> Sgt {
        Sgt {
            segments: vec![SgtSegment::contiguous(phys, length)],
            backing: SgtBacking::Phys,
        }
    }

    /// OS scatter-list variant. Returns `None` for an empty list so a
    /// failed construction leaves the caller's descriptor untouched.
    pub fn from_segments(segments: Vec<SgtSegment>, iommuable: bool) -> Option<Sgt> {
        if segments.is_empty() {
            return None;
        }
        Some(Sgt {
            segments,
            backing: SgtBacking::OsList { iommuable, ipa_translate: None },
        })
    }

    /// Installs the IPA-to-PA translation used on virtualized systems.
    pub fn with_ipa_translate(mut self, translate: Box<IpaTranslate>) -> Sgt {
        if let SgtBacking::OsList { ipa_translate, .. } = &mut self.backing {
            *ipa_translate = Some(translate);
        }
        self
    }

    /// Forward walk over the segments; finite and restartable.
    pub fn iter(&self) -> impl Iterator<Item = &SgtSegment> {
        self.segments.iter()
    }

    pub fn iommuable(&self) -> bool {
        match &self.backing {
            SgtBacking::Phys => false,
            SgtBacking::OsList { iommuable, .. } => *iommuable,
        }
    }

    /// Resolves `ipa` to a physical address and stores the length of the
    /// contiguous run starting there into `pa_len`.
    pub fn ipa_to_pa(&self, ipa: u64, pa_len: &mut u64) -> u64 {
        match &self.backing {
            SgtBacking::OsList { ipa_translate: Some(translate), .. } => translate(ipa, pa_len),
            _ => ipa,
        }
    }

    /// Address to program into the GMMU for `segment`, after any
    /// attribute-dependent transform.
    pub fn gpu_addr(&self, g: &Gpu, segment: &SgtSegment, _attrs: &GmmuAttrs) -> u64 {
        if self.iommuable() {
            g.mem_iommu_translate(segment.dma)
        } else {
            segment.phys
        }
    }

    /// Total bytes described by the table.
    pub fn total_length(&self) -> u64 {
        self.iter().map(|s| s.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn phys_variant_is_one_segment() {
        let sgt = Sgt::from_phys(0x1000, 0x4000);
        let segs: Vec<_> = sgt.iter().collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].dma, segs[0].phys);
        assert!(!sgt.iommuable());
    }

    #[test]
    fn empty_os_list_is_rejected() {
        assert!(Sgt::from_segments(Vec::new(), false).is_none());
    }

    #[test]
    fn ipa_translate_caps_run_length() {
        let segs = vec![SgtSegment::contiguous(0x1_0000, 0x2000)];
        let sgt = Sgt::from_segments(segs, false)
            .unwrap()
            .with_ipa_translate(Box::new(|ipa, pa_len| {
                // Physical runs are broken at 4 KiB in this fake geometry.
                *pa_len = (*pa_len).min(0x1000);
                ipa + 0x10_0000
            }));

        let mut pa_len = 0x2000;
        let pa = sgt.ipa_to_pa(0x1_0000, &mut pa_len);
        assert_eq!(pa, 0x11_0000);
        assert_eq!(pa_len, 0x1000);
    }

    proptest! {
        // Segment lengths always sum to the described size and the walk
        // terminates in one pass over the list.
        #[test]
        fn coverage_and_termination(lengths in proptest::collection::vec(1u64..64u64, 1..32)) {
            let mut segs = Vec::new();
            let mut base = 0x1000u64;
            let mut total = 0u64;
            for len in &lengths {
                let bytes = len * 0x1000;
                segs.push(SgtSegment::contiguous(base, bytes));
                base += bytes;
                total += bytes;
            }
            let sgt = Sgt::from_segments(segs, false).unwrap();
            prop_assert_eq!(sgt.total_length(), total);
            prop_assert_eq!(sgt.iter().count(), lengths.len());
        }
    }
}
