//! FIG type 1 encoders: labels in the EBU Latin character set
//! (ETSI EN 300 401 section 8.1.13).
#![allow(non_camel_case_types)] // Fig1_0 etc. mirror the FIG numbering.
//!
//! A FIG 1 carries exactly one label: charset/extension byte, identifier,
//! the fixed 16-byte character field and the 16-bit short-label flag.

use bytes::BufMut;

use super::{FigCtx, FillStatus};
use crate::ensemble::DabLabel;

/// Writes one FIG 1 block. `ident` is the already-encoded identifier
/// field (EId, SId, or SId + SCIdS).
fn write_label(buf: &mut [u8], ext: u8, ident: &[u8], label: &DabLabel) -> usize {
    let payload = 1 + ident.len() + 16 + 2;
    if buf.len() < 1 + payload {
        return 0;
    }
    let mut b = &mut buf[..];
    b.put_u8(0x20 | (payload as u8)); // FIG type 1
    b.put_u8(ext & 0x07); // charset 0 (EBU Latin), OE 0
    b.put_slice(ident);
    b.put_slice(&label.encode());
    b.put_u16(label.flag);
    1 + payload
}

/// FIG 1/0 — ensemble label.
#[derive(Default)]
pub struct Fig1_0;

impl Fig1_0 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let e = ctx.ensemble;
        let written = write_label(buf, 0, &e.id.to_be_bytes(), &e.label);
        FillStatus { written, complete: written > 0 }
    }
}

/// FIG 1/1 — programme service label. Cycles over all 16-bit services.
#[derive(Default)]
pub struct Fig1_1 {
    next: usize,
}

impl Fig1_1 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let services: Vec<_> = ctx
            .ensemble
            .services
            .iter()
            .filter(|s| s.is_programme())
            .collect();
        fill_label_cycle(&mut self.next, services.len(), buf, |i, buf| {
            let svc = services[i];
            write_label(buf, 1, &(svc.id as u16).to_be_bytes(), &svc.label)
        })
    }
}

/// FIG 1/4 — service component label.
#[derive(Default)]
pub struct Fig1_4 {
    next: usize,
}

impl Fig1_4 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let e = ctx.ensemble;
        let labelled: Vec<_> = e
            .components
            .iter()
            .filter_map(|c| {
                let svc = e.service_by_id(c.service_id)?;
                let label = c.label.as_ref()?;
                Some((c, svc, label))
            })
            .collect();
        fill_label_cycle(&mut self.next, labelled.len(), buf, |i, buf| {
            let (comp, svc, label) = labelled[i];
            // P/D flag, rfa, SCIdS; then the service identifier.
            if svc.is_programme() {
                let mut ident = [0u8; 3];
                ident[0] = comp.scids & 0x0F;
                ident[1..3].copy_from_slice(&(svc.id as u16).to_be_bytes());
                write_label(buf, 4, &ident, label)
            } else {
                let mut ident = [0u8; 5];
                ident[0] = 0x80 | (comp.scids & 0x0F);
                ident[1..5].copy_from_slice(&svc.id.to_be_bytes());
                write_label(buf, 4, &ident, label)
            }
        })
    }
}

/// FIG 1/5 — data service label (32-bit SId).
#[derive(Default)]
pub struct Fig1_5 {
    next: usize,
}

impl Fig1_5 {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        let services: Vec<_> = ctx
            .ensemble
            .services
            .iter()
            .filter(|s| !s.is_programme())
            .collect();
        fill_label_cycle(&mut self.next, services.len(), buf, |i, buf| {
            let svc = services[i];
            write_label(buf, 5, &svc.id.to_be_bytes(), &svc.label)
        })
    }
}

/// Shared cycle logic: one label per call, complete once the last one of
/// the current pass has gone out.
fn fill_label_cycle<F>(next: &mut usize, count: usize, buf: &mut [u8], mut write: F) -> FillStatus
where
    F: FnMut(usize, &mut [u8]) -> usize,
{
    if count == 0 {
        *next = 0;
        return FillStatus { written: 0, complete: true };
    }
    if *next >= count {
        *next = 0;
    }
    let written = write(*next, buf);
    if written == 0 {
        return FillStatus { written: 0, complete: false };
    }
    *next += 1;
    let complete = *next >= count;
    if complete {
        *next = 0;
    }
    FillStatus { written, complete }
}
