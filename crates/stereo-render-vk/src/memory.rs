// SPDX-License-Identifier: CEPL-1.0
use std::ops::{Deref, DerefMut};

use anyhow::{Context as _, Result};
use ash::vk;
use stereo_core::{report, ErrorKind};

use crate::handle::Owned;

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..props.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[i as usize].property_flags.contains(req)
        })
        .ok_or_else(|| {
            report(
                ErrorKind::NoMemoryType,
                Some(&format!("bits {type_bits:#b}, flags {req:?}")),
            )
        })
}

/// Allocates memory for `req` and returns it unbound.
pub(crate) fn allocate<'d>(
    device: &'d ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    req: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Result<Owned<'d, vk::DeviceMemory>> {
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: find_memory_type(props, req.memory_type_bits, flags)?,
        ..Default::default()
    };
    let mem = unsafe { device.allocate_memory(&mai, None) }.context("allocate_memory")?;
    Ok(unsafe { Owned::new(device, mem) })
}

/// Host-visible, coherent buffer. Writes land without an explicit flush.
pub struct HostBuffer<'d> {
    device: &'d ash::Device,
    buffer: Owned<'d, vk::Buffer>,
    memory: Owned<'d, vk::DeviceMemory>,
    size: vk::DeviceSize,
}

impl<'d> HostBuffer<'d> {
    pub fn new(
        device: &'d ash::Device,
        props: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { device.create_buffer(&bci, None) }.context("create_buffer")?;
        let buffer = unsafe { Owned::new(device, buffer) };

        let req = unsafe { device.get_buffer_memory_requirements(buffer.raw()) };
        let memory = allocate(
            device,
            props,
            req,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        unsafe { device.bind_buffer_memory(buffer.raw(), memory.raw(), 0) }
            .context("bind_buffer_memory")?;

        Ok(Self {
            device,
            buffer,
            memory,
            size,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Maps the whole buffer. Unmapped when the guard drops.
    pub fn map(&mut self) -> Result<MappedMemory<'_>> {
        let ptr = unsafe {
            self.device.map_memory(
                self.memory.raw(),
                0,
                self.size,
                vk::MemoryMapFlags::empty(),
            )
        }
        .context("map_memory")?;
        Ok(MappedMemory {
            device: self.device,
            memory: self.memory.raw(),
            bytes: unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), self.size as usize) },
        })
    }
}

pub struct MappedMemory<'a> {
    device: &'a ash::Device,
    memory: vk::DeviceMemory,
    bytes: &'a mut [u8],
}

impl Deref for MappedMemory<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl DerefMut for MappedMemory<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) }
    }
}
