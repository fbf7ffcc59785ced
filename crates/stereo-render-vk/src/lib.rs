// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan + OpenXR backend for the stereo frame loop.
mod context;
mod handle;
mod headset;
mod memory;
mod pool;
mod scene;
mod slot;
mod target;
mod xr;

pub use context::Context;
pub use handle::{DeviceChild, Owned};
pub use headset::{depth_aspect, pick_depth_format, view_mask, Headset};
pub use memory::{find_memory_type, HostBuffer, MappedMemory};
pub use pool::FramePool;
pub use scene::{full_viewport, ScenePipeline, CUBE_VERTEX_COUNT};
pub use slot::FrameSlot;
pub use target::RenderTarget;
pub use xr::{choose_color_format, OpenXrRuntime, ReferenceSpace};
