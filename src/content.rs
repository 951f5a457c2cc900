use vulkanalia::prelude::v1_3::*;

use crate::asset::{Mesh, Texture};
use crate::error::Result;
use crate::gpu::{GpuBuffer, GpuImage, GpuImageView, GpuSampler};
use crate::recorder::CommandRecorder;
use crate::traits::TraitTag;
use crate::vram::Vram;

/// Uploaded vertex streams of a mesh, one buffer per attribute.
#[derive(Debug)]
pub struct GeometryContent {
    vertex_buffers: Vec<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    vertex_count: u32,
    index_count: u32,
    hash: u64,
}

impl GeometryContent {
    pub unsafe fn upload(vram: &Vram, mesh: &Mesh) -> Result<Self> {
        let vertex_buffers = mesh
            .attributes()
            .iter()
            .filter(|a| a.tag != TraitTag::Index)
            .map(|a| vram.upload(&a.bytes, vk::BufferUsageFlags::VERTEX_BUFFER))
            .collect::<Result<Vec<_>>>()?;

        let index_buffer = match mesh.indices() {
            Some(indices) => Some(vram.upload(
                bytemuck::cast_slice(indices),
                vk::BufferUsageFlags::INDEX_BUFFER,
            )?),
            None => None,
        };

        log::debug!(
            "Uploaded mesh {:016x} ({} streams, {} vertices)",
            mesh.hash(),
            vertex_buffers.len(),
            mesh.vertex_count()
        );

        Ok(Self {
            vertex_buffers,
            index_buffer,
            vertex_count: mesh.vertex_count(),
            index_count: mesh.indices().map_or(0, |i| i.len() as u32),
            hash: mesh.hash(),
        })
    }

    /// Wraps existing buffers without taking ownership.
    pub fn from_raw(
        vertex_buffers: &[vk::Buffer],
        index_buffer: Option<vk::Buffer>,
        vertex_count: u32,
        index_count: u32,
        hash: u64,
    ) -> Self {
        Self {
            vertex_buffers: vertex_buffers
                .iter()
                .map(|b| GpuBuffer::from_raw(*b, 0))
                .collect(),
            index_buffer: index_buffer.map(|b| GpuBuffer::from_raw(b, 0)),
            vertex_count,
            index_count,
            hash,
        }
    }

    /// Host-side stand-in with null buffers, sized from `mesh`.
    pub fn placeholder(mesh: &Mesh) -> Self {
        let streams = mesh
            .attributes()
            .iter()
            .filter(|a| a.tag != TraitTag::Index)
            .map(|_| vk::Buffer::null())
            .collect::<Vec<_>>();
        Self::from_raw(
            &streams,
            mesh.indices().map(|_| vk::Buffer::null()),
            mesh.vertex_count(),
            mesh.indices().map_or(0, |i| i.len() as u32),
            mesh.hash(),
        )
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Binds the streams and issues one draw.
    pub fn record_draw(&self, rec: &mut dyn CommandRecorder) {
        if !self.vertex_buffers.is_empty() {
            let buffers = self
                .vertex_buffers
                .iter()
                .map(GpuBuffer::handle)
                .collect::<Vec<_>>();
            let offsets = vec![0; buffers.len()];
            rec.bind_vertex_buffers(&buffers, &offsets);
        }

        match &self.index_buffer {
            Some(index_buffer) => {
                rec.bind_index_buffer(index_buffer.handle());
                rec.draw_indexed(self.index_count, 1, 0, 0, 0);
            }
            None => rec.draw(self.vertex_count, 1, 0, 0),
        }
    }
}

/// A sampled texture: image, view and sampler.
#[derive(Debug)]
pub struct TextureContent {
    image: GpuImage,
    view: GpuImageView,
    sampler: GpuSampler,
    hash: u64,
}

impl TextureContent {
    pub unsafe fn upload(vram: &Vram, texture: &Texture) -> Result<Self> {
        let image = vram.upload_texture(texture)?;
        let view =
            vram.create_image_view(image.handle(), image.format(), vk::ImageAspectFlags::COLOR)?;
        let sampler = vram.create_sampler()?;

        Ok(Self {
            image,
            view,
            sampler,
            hash: texture.hash(),
        })
    }

    pub fn from_raw(
        image: vk::Image,
        view: vk::ImageView,
        sampler: vk::Sampler,
        format: vk::Format,
        extent: vk::Extent2D,
        hash: u64,
    ) -> Self {
        Self {
            image: GpuImage::from_raw(image, format, extent),
            view: GpuImageView::from_raw(view),
            sampler: GpuSampler::from_raw(sampler),
            hash,
        }
    }

    pub fn placeholder(texture: &Texture) -> Self {
        Self::from_raw(
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Sampler::null(),
            texture.format(),
            vk::Extent2D {
                width: texture.width(),
                height: texture.height(),
            },
            texture.hash(),
        )
    }

    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(self.view.handle())
            .sampler(self.sampler.handle())
            .build()
    }
}
