//! The one place draw commands go through.

use vulkanalia::prelude::v1_3::*;

/// Render pass instance to begin: pass, target and clear values.
#[derive(Clone, Copy, Debug)]
pub struct RenderPassInfo {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

impl RenderPassInfo {
    pub fn full_rect(&self) -> vk::Rect2D {
        vk::Rect2D::builder()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(self.extent)
            .build()
    }
}

pub trait CommandRecorder {
    fn begin_render_pass(&mut self, info: &RenderPassInfo);
    fn end_render_pass(&mut self);
    fn set_viewport(&mut self, viewport: vk::Viewport);
    fn set_scissor(&mut self, scissor: vk::Rect2D);
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn bind_vertex_buffers(&mut self, buffers: &[vk::Buffer], offsets: &[u64]);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer);
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    /// Clears the depth attachment of the current pass inside `rect`.
    fn clear_depth(&mut self, rect: vk::Rect2D, depth: f32);
}

/// Records into a Vulkan command buffer.
pub struct VkRecorder<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> VkRecorder<'a> {
    pub fn new(device: &'a Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
        }
    }
}

impl CommandRecorder for VkRecorder<'_> {
    fn begin_render_pass(&mut self, info: &RenderPassInfo) {
        let clear_values = &[
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: info.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: info.clear_depth,
                    stencil: 0,
                },
            },
        ];

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(info.render_pass)
            .framebuffer(info.framebuffer)
            .render_area(info.full_rect())
            .clear_values(clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        };
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        };
    }

    fn bind_vertex_buffers(&mut self, buffers: &[vk::Buffer], offsets: &[u64]) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, buffers, offsets)
        };
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        unsafe {
            self.device.cmd_bind_index_buffer(
                self.command_buffer,
                buffer,
                0,
                vk::IndexType::UINT32,
            )
        };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(
                self.command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn clear_depth(&mut self, rect: vk::Rect2D, depth: f32) {
        let attachment = vk::ClearAttachment::builder()
            .aspect_mask(vk::ImageAspectFlags::DEPTH)
            .color_attachment(0)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
            });
        let rect = vk::ClearRect::builder()
            .rect(rect)
            .base_array_layer(0)
            .layer_count(1);

        unsafe {
            self.device
                .cmd_clear_attachments(self.command_buffer, &[attachment], &[rect])
        };
    }
}

/// A recorded command, as captured by [`CommandLog`].
#[derive(Clone, Debug)]
pub enum Command {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        clear_color: [f32; 4],
        clear_depth: f32,
    },
    EndRenderPass,
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers(Vec<vk::Buffer>),
    BindIndexBuffer(vk::Buffer),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
    },
    ClearDepth(f32),
}

/// Captures commands instead of recording them.
#[derive(Debug, Default)]
pub struct CommandLog {
    pub commands: Vec<Command>,
}

impl CommandLog {
    pub fn draws(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Draw { .. } | Command::DrawIndexed { .. }))
            .count()
    }

    pub fn pipeline_binds(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::BindPipeline(_)))
            .count()
    }
}

impl CommandRecorder for CommandLog {
    fn begin_render_pass(&mut self, info: &RenderPassInfo) {
        self.commands.push(Command::BeginRenderPass {
            render_pass: info.render_pass,
            clear_color: info.clear_color,
            clear_depth: info.clear_depth,
        });
    }

    fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.commands.push(Command::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.commands.push(Command::SetScissor(scissor));
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    fn bind_descriptor_sets(
        &mut self,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.commands.push(Command::BindDescriptorSets {
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn bind_vertex_buffers(&mut self, buffers: &[vk::Buffer], _offsets: &[u64]) {
        self.commands.push(Command::BindVertexBuffers(buffers.to_vec()));
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        self.commands.push(Command::BindIndexBuffer(buffer));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
        });
    }

    fn clear_depth(&mut self, _rect: vk::Rect2D, depth: f32) {
        self.commands.push(Command::ClearDepth(depth));
    }
}
