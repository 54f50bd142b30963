// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lima tests.
//!
//! Helpers shared by the scenario tests in `tests/`, which drive a [`Screen`]
//! and its contexts against the software kernel model.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![allow(missing_debug_implementations, missing_docs)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use lima::sim::{SimKernel, SimSubmission};
use lima::{
    ColorTarget, Context, DrawState, FragmentShader, Screen, ScreenOptions, Surface, VertexShader,
    Viewport,
};
use lima_encoding::{GpFrame, PpFrame, RenderState};

/// The parameters of a test device.
#[derive(Debug, Clone)]
pub struct TestParams {
    pub num_pp: u32,
    pub options: ScreenOptions,
}

impl TestParams {
    pub fn new(num_pp: u32) -> Self {
        Self {
            num_pp,
            options: ScreenOptions::default(),
        }
    }
}

impl Default for TestParams {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A screen on a fresh software kernel, and the kernel for inspection.
pub struct TestDevice {
    pub sim: Arc<SimKernel>,
    pub screen: Screen,
}

impl TestDevice {
    pub fn new(params: &TestParams) -> Result<Self> {
        let sim = Arc::new(SimKernel::mali400(params.num_pp));
        let screen = Screen::new(sim.clone(), params.options)?;
        Ok(Self { sim, screen })
    }

    /// A linear RGBA8888 color buffer of `width` by `height` pixels.
    pub fn color_target(&self, width: u32, height: u32) -> Result<ColorTarget> {
        let bo = self.screen.bo_create(width * height * 4, 0)?;
        Ok(ColorTarget {
            bo,
            width,
            height,
            stride: width * 4,
        })
    }

    /// A context with a `width` by `height` surface bound as framebuffer.
    pub fn context_with_surface(&self, width: u32, height: u32) -> Result<(Context, Surface)> {
        let mut ctx = self.screen.create_context()?;
        let surface = ctx.create_surface(self.color_target(width, height)?, None)?;
        ctx.set_framebuffer(Some(&surface))?;
        Ok((ctx, surface))
    }

    /// Draw state with both shaders in one buffer and a full viewport.
    pub fn draw_state(&self, width: u32, height: u32) -> Result<DrawState> {
        let shaders = self.screen.bo_create(4096, 0)?;
        shaders.write(0, &[0xAB; 64])?;
        Ok(DrawState::new(
            VertexShader {
                bo: shaders.clone(),
                offset: 0,
                size: 64,
                prefetch: 1,
            },
            FragmentShader {
                bo: shaders,
                offset: 0x200,
                size: 32,
                first_word: 0x9,
            },
            Viewport::new(width as f32, height as f32),
        ))
    }

    /// The GP and PP frames of the last flush.
    pub fn last_frames(&self) -> Result<(SimSubmission, GpFrame, SimSubmission, PpFrame)> {
        let jobs = self.sim.submissions();
        let [.., gp, pp] = jobs.as_slice() else {
            return Err(anyhow!("expected at least two submissions"));
        };
        let gp_frame = gp.gp_frame().ok_or_else(|| anyhow!("not a GP job"))?;
        let pp_frame = pp.pp_frame().ok_or_else(|| anyhow!("not a PP job"))?;
        Ok((gp.clone(), gp_frame, pp.clone(), pp_frame))
    }

    /// Reads the command words between two GPU addresses.
    pub fn read_stream(&self, start: u32, end: u32) -> Result<Vec<u32>> {
        let len = end
            .checked_sub(start)
            .ok_or_else(|| anyhow!("stream ends before it starts"))?;
        self.sim
            .read_words(start, len as usize / 4)
            .ok_or_else(|| anyhow!("stream at {start:#x} is not mapped"))
    }

    /// Reads `count` render state records at GPU address `va`.
    pub fn read_render_states(&self, va: u32, count: usize) -> Result<Vec<RenderState>> {
        let bytes = self
            .sim
            .read_va(va, count * size_of::<RenderState>())
            .ok_or_else(|| anyhow!("render states at {va:#x} are not mapped"))?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}
