//! The ring of presentable images and everything recorded per image.

use std::sync::Arc;

use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::KhrSwapchainExtension;

use crate::device::{QueueFamilyIndices, SwapchainSupport};
use crate::error::{Error, Result};
use crate::gpu::{GpuImage, GpuImageView};
use crate::render_pass::DEPTH_FORMAT;
use crate::vram::{subresource_range, Vram};

/// Everything a swapchain is built against that outlives it.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceBinding {
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub indices: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    /// Pass the framebuffers are made compatible with.
    pub render_pass: vk::RenderPass,
    pub command_pool: vk::CommandPool,
    pub prefer_mailbox: bool,
}

/// `B8G8R8A8_UNORM` in `SRGB_NONLINEAR` when offered, otherwise whatever
/// the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => Err(Error::UnsupportedFormat(vk::Format::UNDEFINED)),
        // The surface has no preference.
        [only] if only.format == vk::Format::UNDEFINED => Ok(preferred),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .unwrap_or(formats[0])),
    }
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], prefer_mailbox: bool) -> vk::PresentModeKHR {
    if prefer_mailbox && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let clamp = |min: u32, max: u32, v: u32| min.max(max.min(v));
    vk::Extent2D::builder()
        .width(clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
            requested.width,
        ))
        .height(clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
            requested.height,
        ))
        .build()
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

pub struct Swapchain {
    device: Arc<Device>,
    binding: SurfaceBinding,

    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<GpuImageView>,
    depth: Option<(GpuImage, GpuImageView)>,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<vk::CommandBuffer>,
    fences: Vec<vk::Fence>,
    /// Signalled when the frame's commands finished executing.
    new_frame: vk::Semaphore,
    /// Signalled when the acquired image is ready to be drawn to.
    frame_finished: vk::Semaphore,
    image_index: usize,
}

impl Swapchain {
    /// Builds the image chain for a window of `requested` size. On failure
    /// everything created so far is released.
    pub unsafe fn new(
        instance: &Instance,
        vram: &Vram,
        binding: SurfaceBinding,
        requested: vk::Extent2D,
    ) -> Result<Self> {
        let mut swapchain = Self {
            device: vram.device().clone(),
            binding,
            swapchain: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            depth: None,
            framebuffers: Vec::new(),
            command_buffers: Vec::new(),
            fences: Vec::new(),
            new_frame: vk::Semaphore::null(),
            frame_finished: vk::Semaphore::null(),
            image_index: 0,
        };
        if let Err(e) = swapchain.create(instance, vram, requested) {
            swapchain.destroy();
            return Err(e);
        }
        Ok(swapchain)
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Command buffer of the image acquired last.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers[self.image_index]
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffers[self.image_index]
    }

    unsafe fn create(&mut self, instance: &Instance, vram: &Vram, requested: vk::Extent2D) -> Result<()> {
        let binding = self.binding;
        let support = SwapchainSupport::get(instance, binding.surface, binding.physical_device)?;
        if support.present_modes.is_empty() {
            return Err(Error::SurfaceLost);
        }

        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, binding.prefer_mailbox);
        let extent = choose_extent(&support.capabilities, requested);
        let image_count = choose_image_count(&support.capabilities);
        let (image_sharing_mode, queue_family_indices) = binding.indices.sharing();

        log::info!(
            "Creating swapchain: {}x{}, {image_count} images, {:?}, {present_mode:?}",
            extent.width,
            extent.height,
            surface_format.format
        );

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(binding.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(image_sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        self.swapchain = self.device.create_swapchain_khr(&info, None)?;
        self.images = self.device.get_swapchain_images_khr(self.swapchain)?;
        self.surface_format = surface_format;
        self.extent = extent;

        for image in &self.images {
            let view = vram.create_image_view(*image, surface_format.format, vk::ImageAspectFlags::COLOR)?;
            self.views.push(view);
        }

        let depth_image = vram.create_image(
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        let depth_view = vram.create_image_view(
            depth_image.handle(),
            DEPTH_FORMAT,
            vk::ImageAspectFlags::DEPTH,
        )?;
        vram.image_transfer(
            depth_image.handle(),
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;
        let depth_handle = depth_view.handle();
        self.depth = Some((depth_image, depth_view));

        // Every frame starts by taking the image out of PRESENT_SRC.
        for image in &self.images {
            vram.image_transfer(
                *image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )?;
            vram.image_transfer(
                *image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            )?;
        }

        for view in &self.views {
            let attachments = &[view.handle(), depth_handle];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(binding.render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            self.framebuffers.push(self.device.create_framebuffer(&info, None)?);
        }

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(binding.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(self.framebuffers.len() as u32);
        self.command_buffers = self.device.allocate_command_buffers(&allocate_info)?;

        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..self.framebuffers.len() {
            self.fences.push(self.device.create_fence(&fence_info, None)?);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        self.new_frame = self.device.create_semaphore(&semaphore_info, None)?;
        self.frame_finished = self.device.create_semaphore(&semaphore_info, None)?;

        self.image_index = 0;
        Ok(())
    }

    /// Tears everything down while the device is idle and builds it again.
    pub unsafe fn recreate(&mut self, instance: &Instance, vram: &Vram, requested: vk::Extent2D) -> Result<()> {
        self.device.device_wait_idle()?;
        self.destroy();
        if let Err(e) = self.create(instance, vram, requested) {
            self.destroy();
            return Err(e);
        }
        Ok(())
    }

    /// Releases every per-image object. Safe to call more than once.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_semaphore(self.new_frame, None);
        self.device.destroy_semaphore(self.frame_finished, None);
        self.new_frame = vk::Semaphore::null();
        self.frame_finished = vk::Semaphore::null();

        for fence in self.fences.drain(..) {
            self.device.destroy_fence(fence, None);
        }

        self.views.clear();
        self.depth = None;

        for framebuffer in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(framebuffer, None);
        }

        if !self.command_buffers.is_empty() {
            self.device
                .free_command_buffers(self.binding.command_pool, &self.command_buffers);
            self.command_buffers.clear();
        }

        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain_khr(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Acquires the next image and opens its command buffer. Returns false
    /// when the frame has to be skipped.
    pub unsafe fn start_rendering(&mut self) -> bool {
        let result = self.device.acquire_next_image_khr(
            self.swapchain,
            u64::MAX,
            self.frame_finished,
            vk::Fence::null(),
        );
        self.image_index = match result {
            Ok((index, _)) => index as usize,
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date, skipping frame");
                return false;
            }
            Err(e) => {
                log::error!("Failed to acquire swapchain image: {e}");
                return false;
            }
        };

        match self.begin_frame() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to begin frame: {e}");
                false
            }
        }
    }

    unsafe fn begin_frame(&self) -> Result<()> {
        let fence = self.fences[self.image_index];
        self.device.wait_for_fences(&[fence], true, u64::MAX)?;

        let command_buffer = self.command_buffer();
        self.device
            .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;

        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        self.device.begin_command_buffer(command_buffer, &info)?;

        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::empty())
            .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            )
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .image(self.images[self.image_index])
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR));
        let dependency_info =
            vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        self.device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
        Ok(())
    }

    /// Closes, submits and presents the frame opened by
    /// [`Swapchain::start_rendering`]. Failures are logged and the frame is
    /// dropped.
    pub unsafe fn end_rendering(&mut self) -> bool {
        match self.submit_and_present() {
            Ok(()) => true,
            Err(Error::SwapchainOutOfDate) => {
                log::debug!("Swapchain out of date at present");
                false
            }
            Err(e) => {
                log::error!("Failed to finish frame: {e}");
                false
            }
        }
    }

    unsafe fn submit_and_present(&self) -> Result<()> {
        let command_buffer = self.command_buffer();

        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
            .dst_access_mask(vk::AccessFlags2::empty())
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .image(self.images[self.image_index])
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR));
        let dependency_info =
            vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        self.device.cmd_pipeline_barrier2(command_buffer, &dependency_info);

        self.device.end_command_buffer(command_buffer)?;

        let fence = self.fences[self.image_index];
        self.device.reset_fences(&[fence])?;

        let wait_semaphore_submit_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.frame_finished)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let command_buffer_submit_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(command_buffer);
        let signal_semaphore_submit_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.new_frame)
            .stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS);

        let submit_info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(std::slice::from_ref(&wait_semaphore_submit_info))
            .command_buffer_infos(std::slice::from_ref(&command_buffer_submit_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_semaphore_submit_info));

        self.device
            .queue_submit2(self.binding.graphics_queue, &[submit_info], fence)?;

        let swapchains = &[self.swapchain];
        let image_indices = &[self.image_index as u32];
        let wait_semaphores = &[self.new_frame];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        self.device
            .queue_present_khr(self.binding.present_queue, &present_info)?;
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}
