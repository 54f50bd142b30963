// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytemuck::{Pod, Zeroable};

/// How a vertex attribute channel is stored in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Float,
    Fixed,
    Signed,
    Unsigned,
}

/// Vertex fetch type, numbered as the hardware expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AttribType {
    Float = 0x000,
    I16 = 0x004,
    U16 = 0x005,
    I8 = 0x006,
    U8 = 0x007,
    I8N = 0x008,
    U8N = 0x009,
    I16N = 0x00A,
    U16N = 0x00B,
    Fixed = 0x101,
}

impl AttribType {
    /// Picks the fetch type for channels of `bits` width.
    ///
    /// 32-bit integers have no fetch type of their own and are read as
    /// floats, as are any other unsupported combinations.
    pub fn for_channel(kind: ChannelKind, bits: u32, normalized: bool) -> Self {
        match (kind, bits, normalized) {
            (ChannelKind::Fixed, _, _) => Self::Fixed,
            (ChannelKind::Signed, 8, false) => Self::I8,
            (ChannelKind::Signed, 8, true) => Self::I8N,
            (ChannelKind::Signed, 16, false) => Self::I16,
            (ChannelKind::Signed, 16, true) => Self::I16N,
            (ChannelKind::Unsigned, 8, false) => Self::U8,
            (ChannelKind::Unsigned, 8, true) => Self::U8N,
            (ChannelKind::Unsigned, 16, false) => Self::U16,
            (ChannelKind::Unsigned, 16, true) => Self::U16N,
            _ => Self::Float,
        }
    }
}

/// One entry of the attribute table read by the vertex shader unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct AttributeDescriptor {
    pub address: u32,
    pub format: u32,
}

impl AttributeDescriptor {
    pub fn new(address: u32, stride: u32, ty: AttribType, components: u32) -> Self {
        debug_assert!((1..=4).contains(&components));
        Self {
            address,
            format: (stride << 11) | ((ty as u32) << 2) | (components - 1),
        }
    }
}

/// One entry of the varying table written by the vertex shader unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct VaryingDescriptor {
    pub address: u32,
    pub format: u32,
}

impl VaryingDescriptor {
    /// A vec4 of 32-bit floats per vertex, the layout of `gl_Position`.
    pub const VEC4_F32: u32 = 0x8020;

    pub fn position(address: u32) -> Self {
        Self {
            address,
            format: Self::VEC4_F32,
        }
    }
}
