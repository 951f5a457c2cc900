use std::collections::HashSet;
use std::sync::Arc;

use vulkanalia::prelude::v1_3::*;

use crate::asset::{bytes_per_pixel, Texture};
use crate::error::{Error, Result};
use crate::gpu::{GpuBuffer, GpuImage, GpuImageView, GpuSampler};

/// Formats textures are checked against when the allocator starts.
const CANDIDATE_FORMATS: &[vk::Format] = &[
    vk::Format::R8_UNORM,
    vk::Format::R8G8_UNORM,
    vk::Format::R8G8B8_UNORM,
    vk::Format::R8G8B8_SRGB,
    vk::Format::B8G8R8_UNORM,
    vk::Format::B8G8R8_SRGB,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R32G32B32A32_SFLOAT,
];

/// Returns the first memory type allowed by `type_bits` whose flags include `properties`.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..memory.memory_type_count)
        .find(|i| {
            let suitable = (type_bits & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            suitable && memory_type.property_flags.contains(properties)
        })
        .ok_or(Error::NoMemoryType(properties))
}

/// Four-channel counterpart of a three-channel format.
pub fn promoted_format(format: vk::Format) -> Option<vk::Format> {
    match format {
        vk::Format::R8G8B8_UNORM => Some(vk::Format::R8G8B8A8_UNORM),
        vk::Format::R8G8B8_SRGB => Some(vk::Format::R8G8B8A8_SRGB),
        vk::Format::B8G8R8_UNORM => Some(vk::Format::B8G8R8A8_UNORM),
        vk::Format::B8G8R8_SRGB => Some(vk::Format::B8G8R8A8_SRGB),
        _ => None,
    }
}

/// Pads every three-byte pixel with an opaque fourth byte.
pub fn widen_pixels(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(3)
        .flat_map(|p| [p[0], p[1], p[2], 0xFF])
        .collect()
}

/// Picks the format a texture is stored in and the bytes to upload.
pub fn resolve_texture(texture: &Texture, supported: &HashSet<i32>) -> Result<(vk::Format, Vec<u8>)> {
    let format = texture.format();
    if supported.contains(&format.as_raw()) {
        return Ok((format, texture.pixels().to_vec()));
    }

    match promoted_format(format) {
        Some(promoted) if supported.contains(&promoted.as_raw()) => {
            log::warn!("Format {format:?} is not sampleable, promoting to {promoted:?}");
            Ok((promoted, widen_pixels(texture.pixels())))
        }
        _ => Err(Error::UnsupportedFormat(format)),
    }
}

/// Access masks and stages of a supported layout transition.
pub fn transition_masks(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<(
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
)> {
    let masks = match (from, to) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        _ => return Err(Error::UnsupportedTransition { from, to }),
    };
    Ok(masks)
}

/// Device memory allocator.
///
/// Uploads and layout transitions are recorded on a dedicated transfer queue
/// and waited on before returning.
pub struct Vram {
    device: Arc<Device>,
    memory: vk::PhysicalDeviceMemoryProperties,
    sampled_formats: HashSet<i32>,
    transfer_queue: vk::Queue,
    transfer_pool: vk::CommandPool,
}

impl Vram {
    pub unsafe fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<Device>,
        transfer_family: u32,
        transfer_queue: vk::Queue,
    ) -> Result<Self> {
        let memory = instance.get_physical_device_memory_properties(physical_device);

        let sampled_formats = CANDIDATE_FORMATS
            .iter()
            .filter(|f| {
                instance
                    .get_physical_device_format_properties(physical_device, **f)
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
            })
            .map(|f| f.as_raw())
            .collect();

        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(transfer_family);
        let transfer_pool = device.create_command_pool(&info, None)?;

        Ok(Self {
            device,
            memory,
            sampled_formats,
            transfer_queue,
            transfer_pool,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub unsafe fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = self.device.create_buffer(&buffer_info, None)?;

        let requirements = self.device.get_buffer_memory_requirements(buffer);
        let memory = match self.allocate(requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };
        self.device.bind_buffer_memory(buffer, memory, 0)?;

        Ok(GpuBuffer::owned(
            self.device.clone(),
            buffer,
            memory,
            size,
            properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        ))
    }

    unsafe fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type = find_memory_type(&self.memory, requirements.memory_type_bits, properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        Ok(self.device.allocate_memory(&alloc_info, None)?)
    }

    /// Host-visible scratch buffer holding `bytes`.
    unsafe fn staging(&self, bytes: &[u8]) -> Result<GpuBuffer> {
        let staging = self.create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write(0, bytes)?;
        Ok(staging)
    }

    /// Device-local copy of `bytes`.
    pub unsafe fn upload(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        let size = bytes.len() as u64;
        let staging = self.staging(bytes)?;
        let buffer = self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        self.one_shot(|device, command_buffer| {
            let regions = vk::BufferCopy::builder()
                .src_offset(0)
                .dst_offset(0)
                .size(size.max(1));
            device.cmd_copy_buffer(command_buffer, staging.handle(), buffer.handle(), &[regions]);
        })?;

        Ok(buffer)
    }

    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<GpuImage> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::_1);

        let image = self.device.create_image(&image_info, None)?;

        let requirements = self.device.get_image_memory_requirements(image);
        let memory = match self.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_image(image, None);
                return Err(e);
            }
        };
        self.device.bind_image_memory(image, memory, 0)?;

        Ok(GpuImage::owned(self.device.clone(), image, memory, format, extent))
    }

    pub unsafe fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<GpuImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::_2D)
            .format(format)
            .subresource_range(subresource_range(aspect));

        let view = self.device.create_image_view(&info, None)?;
        Ok(GpuImageView::owned(self.device.clone(), view))
    }

    pub unsafe fn create_sampler(&self) -> Result<GpuSampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = self.device.create_sampler(&info, None)?;
        Ok(GpuSampler::owned(self.device.clone(), sampler))
    }

    /// Sampled image holding `texture`, left in `SHADER_READ_ONLY_OPTIMAL`.
    pub unsafe fn upload_texture(&self, texture: &Texture) -> Result<GpuImage> {
        let (format, pixels) = resolve_texture(texture, &self.sampled_formats)?;
        debug_assert_eq!(
            bytes_per_pixel(format).map(|bpp| bpp * (texture.width() * texture.height()) as usize),
            Some(pixels.len())
        );

        let extent = vk::Extent2D {
            width: texture.width(),
            height: texture.height(),
        };
        let staging = self.staging(&pixels)?;
        let image = self.create_image(
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        self.image_transfer(
            image.handle(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        self.one_shot(|device, command_buffer| {
            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });

            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })?;

        self.image_transfer(
            image.handle(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        Ok(image)
    }

    pub unsafe fn image_transfer(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) -> Result<()> {
        let (src_access_mask, dst_access_mask, src_stage_mask, dst_stage_mask) =
            transition_masks(from, to)?;

        self.one_shot(|device, command_buffer| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(from)
                .new_layout(to)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(subresource_range(aspect))
                .src_access_mask(src_access_mask)
                .dst_access_mask(dst_access_mask);

            device.cmd_pipeline_barrier(
                command_buffer,
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[] as &[vk::MemoryBarrier],
                &[] as &[vk::BufferMemoryBarrier],
                &[barrier],
            );
        })
    }

    /// Records `f` into a fresh command buffer and waits for it to execute.
    unsafe fn one_shot(&self, f: impl FnOnce(&Device, vk::CommandBuffer)) -> Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(self.transfer_pool)
            .command_buffer_count(1);

        let command_buffer = self.device.allocate_command_buffers(&alloc_info)?[0];

        let result = (|| -> Result<()> {
            let info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(command_buffer, &info)?;

            f(&self.device, command_buffer);

            self.device.end_command_buffer(command_buffer)?;

            let command_buffers = &[command_buffer];
            let info = vk::SubmitInfo::builder().command_buffers(command_buffers);
            self.device
                .queue_submit(self.transfer_queue, &[info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.transfer_queue)?;
            Ok(())
        })();

        self.device
            .free_command_buffers(self.transfer_pool, &[command_buffer]);
        result
    }
}

impl Drop for Vram {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.transfer_pool, None);
        }
    }
}

pub(crate) fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::builder()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_type_count = flags.len() as u32;
        for (i, f) in flags.iter().enumerate() {
            memory.memory_types[i].property_flags = *f;
        }
        memory
    }

    #[test]
    fn memory_type_is_first_superset_allowed_by_mask() {
        let memory = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&memory, 0b111, host).unwrap(), 1);
        assert_eq!(find_memory_type(&memory, 0b100, host).unwrap(), 2);
        assert!(matches!(
            find_memory_type(&memory, 0b001, host),
            Err(Error::NoMemoryType(_))
        ));
    }

    #[test]
    fn three_channel_textures_are_promoted() {
        let supported: HashSet<i32> = [vk::Format::R8G8B8A8_UNORM.as_raw()].into_iter().collect();
        let texture =
            Texture::from_pixels(2, 1, vk::Format::R8G8B8_UNORM, vec![10, 20, 30, 40, 50, 60])
                .unwrap();

        let (format, pixels) = resolve_texture(&texture, &supported).unwrap();
        assert_eq!(format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(pixels, vec![10, 20, 30, 0xFF, 40, 50, 60, 0xFF]);
    }

    #[test]
    fn supported_formats_pass_through() {
        let supported: HashSet<i32> = [vk::Format::R8G8B8_UNORM.as_raw()].into_iter().collect();
        let texture = Texture::from_pixels(1, 1, vk::Format::R8G8B8_UNORM, vec![1, 2, 3]).unwrap();
        let (format, pixels) = resolve_texture(&texture, &supported).unwrap();
        assert_eq!(format, vk::Format::R8G8B8_UNORM);
        assert_eq!(pixels, vec![1, 2, 3]);

        let empty = HashSet::new();
        assert!(matches!(
            resolve_texture(&texture, &empty),
            Err(Error::UnsupportedFormat(vk::Format::R8G8B8_UNORM))
        ));
    }

    #[test]
    fn transitions_follow_the_table() {
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        )
        .is_ok());
        assert!(transition_masks(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        )
        .is_ok());
        assert!(matches!(
            transition_masks(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::UNDEFINED
            ),
            Err(Error::UnsupportedTransition { .. })
        ));
    }
}
