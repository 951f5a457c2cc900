//! Owned device handles.
//!
//! Each handle keeps the logical device that created it and releases its
//! objects on drop. Handles built with `from_raw` own nothing.

use std::sync::Arc;

use vulkanalia::prelude::v1_3::*;

use crate::error::Result;

pub struct GpuBuffer {
    device: Option<Arc<Device>>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    host_visible: bool,
}

impl GpuBuffer {
    pub(crate) fn owned(
        device: Arc<Device>,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        size: u64,
        host_visible: bool,
    ) -> Self {
        Self {
            device: Some(device),
            buffer,
            memory,
            size,
            host_visible,
        }
    }

    pub fn from_raw(buffer: vk::Buffer, size: u64) -> Self {
        Self {
            device: None,
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            host_visible: false,
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `bytes` into host-visible memory at `offset`.
    pub unsafe fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let Some(device) = &self.device else {
            return Ok(());
        };
        if bytes.is_empty() || !self.host_visible {
            return Ok(());
        }

        let memory = device.map_memory(
            self.memory,
            offset,
            bytes.len() as u64,
            vk::MemoryMapFlags::empty(),
        )?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), memory.cast(), bytes.len());
        device.unmap_memory(self.memory);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            unsafe {
                device.destroy_buffer(self.buffer, None);
                device.free_memory(self.memory, None);
            }
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish()
    }
}

pub struct GpuImage {
    device: Option<Arc<Device>>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl GpuImage {
    pub(crate) fn owned(
        device: Arc<Device>,
        image: vk::Image,
        memory: vk::DeviceMemory,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            device: Some(device),
            image,
            memory,
            format,
            extent,
        }
    }

    /// Wraps an image owned elsewhere, e.g. by a swapchain.
    pub fn from_raw(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            device: None,
            image,
            memory: vk::DeviceMemory::null(),
            format,
            extent,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            unsafe {
                device.destroy_image(self.image, None);
                device.free_memory(self.memory, None);
            }
        }
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .finish()
    }
}

pub struct GpuImageView {
    device: Option<Arc<Device>>,
    view: vk::ImageView,
}

impl GpuImageView {
    pub(crate) fn owned(device: Arc<Device>, view: vk::ImageView) -> Self {
        Self {
            device: Some(device),
            view,
        }
    }

    pub fn from_raw(view: vk::ImageView) -> Self {
        Self { device: None, view }
    }

    pub fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl std::fmt::Debug for GpuImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GpuImageView").field(&self.view).finish()
    }
}

impl Drop for GpuImageView {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_image_view(self.view, None) };
        }
    }
}

pub struct GpuSampler {
    device: Option<Arc<Device>>,
    sampler: vk::Sampler,
}

impl GpuSampler {
    pub(crate) fn owned(device: Arc<Device>, sampler: vk::Sampler) -> Self {
        Self {
            device: Some(device),
            sampler,
        }
    }

    pub fn from_raw(sampler: vk::Sampler) -> Self {
        Self {
            device: None,
            sampler,
        }
    }

    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl std::fmt::Debug for GpuSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GpuSampler").field(&self.sampler).finish()
    }
}

impl Drop for GpuSampler {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_sampler(self.sampler, None) };
        }
    }
}
