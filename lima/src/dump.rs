// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logging of submitted command streams, enabled by [`DebugFlags::DUMP`].
//!
//! [`DebugFlags::DUMP`]: crate::DebugFlags::DUMP

use std::fmt::Debug;

use lima_encoding::{GpFrame, PlbuCmd, PpFrame, RenderState, VsCmd};

/// One line per command: GPU address, both words and the decoded command.
fn stream_lines<T: Debug>(
    base: u32,
    words: &[u32],
    decode: impl Fn([u32; 2]) -> Option<T>,
) -> Vec<String> {
    words
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| {
            let va = base + (i * 8) as u32;
            let words = [pair[0], pair[1]];
            match decode(words) {
                Some(cmd) => format!("{va:08x}: {:08x} {:08x}  {cmd:?}", words[0], words[1]),
                None => format!("{va:08x}: {:08x} {:08x}  ?", words[0], words[1]),
            }
        })
        .collect()
}

pub(crate) fn vs_lines(base: u32, words: &[u32]) -> Vec<String> {
    stream_lines(base, words, VsCmd::decode)
}

pub(crate) fn plbu_lines(base: u32, words: &[u32]) -> Vec<String> {
    stream_lines(base, words, PlbuCmd::decode)
}

pub(crate) fn gp_job(frame: &GpFrame, vs: &[u32], plbu: &[u32]) {
    log::info!("dump: gp frame {frame:x?}");
    for line in vs_lines(frame.vs_cmd_start, vs) {
        log::info!("dump: vs {line}");
    }
    for line in plbu_lines(frame.plbu_cmd_start, plbu) {
        log::info!("dump: plbu {line}");
    }
}

pub(crate) fn pp_job(frame: &PpFrame, render_states: &[RenderState]) {
    log::info!("dump: pp frame {:x?}", frame.frame);
    for (i, wb) in frame.wb.iter().enumerate().filter(|(_, wb)| wb.is_enabled()) {
        log::info!("dump: pp wb{i} {wb:x?}");
    }
    let num_pp = frame.num_pp as usize;
    log::info!(
        "dump: pp streams {:08x?}",
        &frame.plbu_array_address[..num_pp.min(frame.plbu_array_address.len())]
    );
    for (i, rsw) in render_states.iter().enumerate() {
        let va = frame.frame.render_address + (i * size_of::<RenderState>()) as u32;
        log::info!("dump: rsw {va:08x}: {:08x?}", bytemuck::cast_ref::<_, [u32; 16]>(rsw));
    }
}
