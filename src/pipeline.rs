//! Graphics pipelines and the per-frame uniform accumulation behind them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use vulkanalia::prelude::v1_3::*;

use crate::asset::Topology;
use crate::content::{GeometryContent, TextureContent};
use crate::descriptor::{self, BlendMode, Descriptor, DescriptorItem};
use crate::error::{Error, Result};
use crate::layer::Style;
use crate::material::{sampler_name, Material, MaterialBuilder};
use crate::rate::{Rate, DYNAMIC_RATE_COUNT, STATIC_RATE_COUNT};
use crate::recorder::CommandRecorder;
use crate::shader::{Shader, ShaderStage};
use crate::traits::{Trait, TraitTag};
use crate::ubo::{DynamicUbo, PendingWrite, SamplerUbo, StaticUbo, UboKind};
use crate::vram::Vram;

/// Sets a single descriptor pool can hand out.
const POOL_SET_BUDGET: u32 = 8;
const POOL_DESCRIPTORS_PER_TYPE: u32 = 32;

/// Dynamic rates up to and including this index split batches between levels.
const LEVEL_CUTOFF: usize = 1;

/// One recorded draw: dynamic offsets plus indices into the pipeline's
/// sampler and geometry sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineSubscriber {
    pub dynamic_offsets: [u32; DYNAMIC_RATE_COUNT],
    pub sampler_set_index: u32,
    pub geometry_set_index: u32,
}

/// Device objects of an initialized pipeline. Dropping it releases them all,
/// including any descriptor set still allocated from its pools.
struct PipelineGpu {
    device: Arc<Device>,
    pools: Vec<vk::DescriptorPool>,
    owners: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
    set_layouts: [vk::DescriptorSetLayout; 3],
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    static_set: vk::DescriptorSet,
    dynamic_set: vk::DescriptorSet,
}

impl PipelineGpu {
    fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            pools: Vec::new(),
            owners: HashMap::new(),
            set_layouts: [vk::DescriptorSetLayout::null(); 3],
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            static_set: vk::DescriptorSet::null(),
            dynamic_set: vk::DescriptorSet::null(),
        }
    }

    unsafe fn create_pool(&mut self) -> Result<vk::DescriptorPool> {
        let sizes = [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        ]
        .map(|type_| {
            vk::DescriptorPoolSize::builder()
                .type_(type_)
                .descriptor_count(POOL_DESCRIPTORS_PER_TYPE)
                .build()
        });

        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SET_BUDGET)
            .pool_sizes(&sizes);

        let pool = self
            .device
            .create_descriptor_pool(&info, None)
            .map_err(Error::DescriptorAllocation)?;
        self.pools.push(pool);
        Ok(pool)
    }

    /// Allocates one set, chaining a new pool when the last one runs dry.
    unsafe fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = &[layout];
        if let Some(pool) = self.pools.last().copied() {
            let info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(layouts);
            match self.device.allocate_descriptor_sets(&info) {
                Ok(sets) => {
                    self.owners.insert(sets[0], pool);
                    return Ok(sets[0]);
                }
                Err(vk::ErrorCode::OUT_OF_POOL_MEMORY | vk::ErrorCode::FRAGMENTED_POOL) => {}
                Err(e) => return Err(Error::DescriptorAllocation(e)),
            }
        }

        let pool = self.create_pool()?;
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        let set = self
            .device
            .allocate_descriptor_sets(&info)
            .map_err(Error::DescriptorAllocation)?[0];
        self.owners.insert(set, pool);
        Ok(set)
    }

    unsafe fn free(&mut self, set: vk::DescriptorSet) {
        if let Some(pool) = self.owners.remove(&set)
            && let Err(e) = self.device.free_descriptor_sets(pool, &[set])
        {
            log::warn!("Failed to free descriptor set: {e}");
        }
    }
}

impl Drop for PipelineGpu {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            for layout in self.set_layouts {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for pool in self.pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

/// A graphics pipeline together with everything its draws read: three
/// descriptor sets (static UBOs, dynamic UBOs, samplers) and the rolling list
/// of subscribers accumulated during a frame.
pub struct Pipeline {
    hash: u64,
    material: Arc<Material>,
    blend: BlendMode,
    depth: bool,
    shaders: Vec<Shader>,
    statics: [StaticUbo; STATIC_RATE_COUNT],
    dynamics: [DynamicUbo; DYNAMIC_RATE_COUNT],
    texture_count: usize,
    pending_textures: Vec<Option<Arc<TextureContent>>>,
    pending_geometry: Option<Arc<GeometryContent>>,
    sampler_sets: Vec<SamplerUbo>,
    geometry_sets: Vec<Option<Arc<GeometryContent>>>,
    /// Committed subscribers followed by the slot being filled.
    subscribers: Vec<PipelineSubscriber>,
    gpu: Option<PipelineGpu>,
}

type Handler = fn(&mut Draft, &[DescriptorItem], &[vk::Format]) -> Result<bool>;

/// Settings collected from a descriptor before the pipeline exists.
struct Draft {
    material: Option<Arc<Material>>,
    blend: BlendMode,
    depth: bool,
}

impl Draft {
    /// Hand-written stages: shader files and inline sources.
    fn from_code(&mut self, items: &[DescriptorItem], _: &[vk::Format]) -> Result<bool> {
        let mut stages = Vec::new();
        for item in items {
            match item {
                DescriptorItem::ShaderFile(path) | DescriptorItem::FilePath(path) => {
                    let Some(stage) = item.shader_stage() else {
                        continue;
                    };
                    stages.push((stage, std::fs::read_to_string(path)?));
                }
                DescriptorItem::ShaderSource { stage, source } => {
                    stages.push((*stage, source.clone()));
                }
                _ => {}
            }
        }
        if stages.is_empty() {
            return Ok(false);
        }

        let (inputs, topology) = match descriptor::mesh_of(items) {
            Some(mesh) => {
                let inputs = MaterialBuilder::from_mesh(&mesh)?
                    .generate()?
                    .stage(ShaderStage::Vertex)
                    .map(|s| s.inputs.clone())
                    .unwrap_or_default();
                (inputs, mesh.topology())
            }
            None => (Vec::new(), Topology::Triangles),
        };
        self.material = Some(Arc::new(Material::from_code(stages, inputs, topology)));
        Ok(true)
    }

    fn from_material(&mut self, items: &[DescriptorItem], _: &[vk::Format]) -> Result<bool> {
        let material = items.iter().find_map(|item| match item {
            DescriptorItem::Material(material) => Some(material),
            _ => None,
        });
        match material {
            Some(material) => {
                self.material = Some(material.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Generates a material from meshes, textures and colors.
    fn from_construct(&mut self, items: &[DescriptorItem], formats: &[vk::Format]) -> Result<bool> {
        let Some(inner) = items.iter().find_map(|item| match item {
            DescriptorItem::Construct(inner) => Some(inner),
            _ => None,
        }) else {
            return Ok(false);
        };

        let mesh = descriptor::mesh_of(inner);
        let textures = descriptor::textures_of(inner)?;
        let colors = descriptor::colors_of(inner);
        if mesh.is_none() && textures.is_empty() && colors.is_empty() {
            return Ok(false);
        }

        let mut builder = match &mesh {
            Some(mesh) => MaterialBuilder::from_mesh(mesh)?,
            None => MaterialBuilder::new(Topology::Triangles),
        };
        for texture in textures {
            builder.texturize(Rate::PerPixel, Trait::texture(texture));
        }
        if let Some(color) = colors.first() {
            builder.texturize(Rate::PerPixel, Trait::vec4(TraitTag::Color, *color));
        }
        for format in formats {
            builder.output(*format)?;
        }

        for item in descriptor::flatten(inner) {
            self.apply_modifier(item);
        }
        self.material = Some(Arc::new(builder.generate()?));
        Ok(true)
    }

    fn apply_modifier(&mut self, item: &DescriptorItem) {
        match item {
            DescriptorItem::Layer(style) if style.contains(Style::HIERARCHICAL) => {
                self.depth = false;
            }
            DescriptorItem::Blend(blend) => self.blend = *blend,
            _ => {}
        }
    }
}

impl Pipeline {
    /// Builds the host side of a pipeline: material, shaders and UBO layouts.
    pub fn from_descriptor(
        descriptor: &Descriptor,
        attachment_formats: &[vk::Format],
        min_ubo_alignment: u64,
    ) -> Result<Self> {
        let mut draft = Draft {
            material: None,
            blend: BlendMode::default(),
            depth: true,
        };
        for item in descriptor.items() {
            draft.apply_modifier(item);
        }

        let handlers: [Handler; 3] = [Draft::from_code, Draft::from_material, Draft::from_construct];
        let mut consumed = false;
        for handler in handlers {
            if handler(&mut draft, descriptor.items(), attachment_formats)? {
                consumed = true;
                break;
            }
        }
        if !consumed {
            let wrapped = [DescriptorItem::Construct(descriptor.items().to_vec())];
            draft.from_construct(&wrapped, attachment_formats)?;
        }

        let Some(material) = draft.material else {
            return Err(Error::InvalidPipeline);
        };
        Self::new(material, draft.blend, draft.depth, min_ubo_alignment)
    }

    pub fn new(
        material: Arc<Material>,
        blend: BlendMode,
        depth: bool,
        min_ubo_alignment: u64,
    ) -> Result<Self> {
        let mut hasher = DefaultHasher::new();
        material.hash().hash(&mut hasher);
        blend.hash(&mut hasher);
        depth.hash(&mut hasher);
        let hash = hasher.finish();
        if hash == 0 {
            return Err(Error::InvalidPipeline);
        }

        let mut shaders = Vec::new();
        for stage in material.stages() {
            let mut shader = Shader::new(stage.stage, stage.source.clone());
            for input in &stage.inputs {
                shader.add_input(input)?;
            }
            shaders.push(shader);
        }

        let mut statics = Rate::STATIC.map(|rate| StaticUbo::new(rate, Vec::new()));
        for (ubo, rate) in statics.iter_mut().zip(Rate::STATIC) {
            *ubo = StaticUbo::create(rate, material.uniforms_at(rate), min_ubo_alignment)?;
        }
        let mut dynamics = Rate::DYNAMIC.map(|rate| DynamicUbo::new(rate, Vec::new()));
        for (ubo, rate) in dynamics.iter_mut().zip(Rate::DYNAMIC) {
            *ubo = DynamicUbo::create(rate, material.uniforms_at(rate), min_ubo_alignment)?;
        }

        let texture_count = material.texture_count();
        let mut pipeline = Self {
            hash,
            material,
            blend,
            depth,
            shaders,
            statics,
            dynamics,
            texture_count,
            pending_textures: vec![None; texture_count],
            pending_geometry: None,
            sampler_sets: vec![SamplerUbo::new(vec![None; texture_count])],
            geometry_sets: vec![None],
            subscribers: vec![PipelineSubscriber::default()],
            gpu: None,
        };
        pipeline.assign_stage_flags();
        Ok(pipeline)
    }

    /// Stage mask of every UBO: the stages whose source names one of its uniforms.
    fn assign_stage_flags(&mut self) {
        for ubo in &mut self.statics {
            let symbols = ubo.uniforms().iter().map(|u| u.value.tag().symbol());
            ubo.set_stage_flags(stage_mask(&self.shaders, symbols.collect()));
        }
        for ubo in &mut self.dynamics {
            let symbols = ubo.uniforms().iter().map(|u| u.value.tag().symbol());
            ubo.set_stage_flags(stage_mask(&self.shaders, symbols.collect()));
        }
    }

    fn sampler_stage_flags(&self, index: usize) -> vk::ShaderStageFlags {
        stage_mask(&self.shaders, vec![sampler_name(index)])
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    pub fn depth(&self) -> bool {
        self.depth
    }

    pub fn shaders(&self) -> &[Shader] {
        &self.shaders
    }

    pub fn texture_count(&self) -> usize {
        self.texture_count
    }

    pub fn is_initialized(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn static_ubo(&self, rate: Rate) -> Option<&StaticUbo> {
        rate.static_index().map(|i| &self.statics[i])
    }

    pub fn dynamic_ubo(&self, rate: Rate) -> Option<&DynamicUbo> {
        rate.dynamic_index().map(|i| &self.dynamics[i])
    }

    /// Subscribers committed so far this frame.
    pub fn subscribers(&self) -> &[PipelineSubscriber] {
        &self.subscribers[..self.subscribers.len() - 1]
    }

    pub fn sampler_sets(&self) -> &[SamplerUbo] {
        &self.sampler_sets
    }

    pub fn geometry_sets(&self) -> &[Option<Arc<GeometryContent>>] {
        &self.geometry_sets
    }

    /// Writes `value` into the block currently being filled at its rate.
    pub fn set_uniform(&mut self, value: &Trait) -> bool {
        let mut stored = false;
        for ubo in &mut self.statics {
            stored |= ubo.set(value);
        }
        for ubo in &mut self.dynamics {
            stored |= ubo.set(value);
        }
        stored
    }

    pub fn set_geometry(&mut self, geometry: Option<Arc<GeometryContent>>) {
        self.pending_geometry = geometry;
    }

    pub fn set_texture(&mut self, index: usize, texture: Option<Arc<TextureContent>>) {
        if let Some(slot) = self.pending_textures.get_mut(index) {
            *slot = texture;
        }
    }

    fn pending_sampler_index(&self) -> usize {
        let last = self.sampler_sets.len() - 1;
        if self.sampler_sets[last].matches(&self.pending_textures) {
            last
        } else {
            last + 1
        }
    }

    fn pending_geometry_index(&self) -> usize {
        let last = self.geometry_sets.len() - 1;
        if same_geometry(&self.geometry_sets[last], &self.pending_geometry) {
            last
        } else {
            last + 1
        }
    }

    fn capture(&self) -> PipelineSubscriber {
        let mut dynamic_offsets = [0; DYNAMIC_RATE_COUNT];
        for (offset, ubo) in dynamic_offsets.iter_mut().zip(&self.dynamics) {
            *offset = ubo.current_offset();
        }
        PipelineSubscriber {
            dynamic_offsets,
            sampler_set_index: self.pending_sampler_index() as u32,
            geometry_set_index: self.pending_geometry_index() as u32,
        }
    }

    /// Commits the values set at `rate`.
    ///
    /// At instance rate this also records a subscriber. With `subscribe`
    /// it is appended to the pipeline's own list; otherwise it only replaces
    /// the slot being filled and the caller keeps track of it.
    pub fn push_uniforms(&mut self, rate: Rate, subscribe: bool) -> Option<PipelineSubscriber> {
        let Some(index) = rate.dynamic_index() else {
            if cfg!(debug_assertions) {
                log::warn!("Ignoring push of {rate:?} uniforms: only dynamic rates can be pushed");
            }
            return None;
        };

        match rate {
            Rate::PerInstance => {
                let subscriber = self.capture();
                let current = self.subscribers.len() - 1;
                self.subscribers[current] = subscriber;
                if subscribe {
                    self.subscribers.push(PipelineSubscriber::default());
                }
                self.dynamics[index].push();
                Some(subscriber)
            }
            Rate::PerRenderable => {
                self.dynamics[index].push();
                if self.pending_sampler_index() == self.sampler_sets.len() {
                    self.sampler_sets
                        .push(SamplerUbo::new(self.pending_textures.clone()));
                }
                if self.pending_geometry_index() == self.geometry_sets.len() {
                    self.geometry_sets.push(self.pending_geometry.clone());
                }
                None
            }
            _ => {
                self.dynamics[index].push();
                None
            }
        }
    }

    /// Drops everything accumulated during the last frame.
    pub fn reset_uniforms(&mut self) {
        self.subscribers.clear();
        self.subscribers.push(PipelineSubscriber::default());

        self.geometry_sets.clear();
        self.geometry_sets.push(None);

        for mut removed in self.sampler_sets.drain(1..) {
            let set = removed.take_set();
            if let Some(gpu) = &mut self.gpu
                && set != vk::DescriptorSet::null()
            {
                unsafe { gpu.free(set) };
            }
        }

        for ubo in &mut self.dynamics {
            ubo.reset();
        }
        self.pending_geometry = None;
        self.pending_textures.iter_mut().for_each(|t| *t = None);
    }

    fn handles(&self) -> (vk::Pipeline, vk::PipelineLayout) {
        self.gpu
            .as_ref()
            .map_or((vk::Pipeline::null(), vk::PipelineLayout::null()), |g| {
                (g.pipeline, g.layout)
            })
    }

    fn bind(&self, rec: &mut dyn CommandRecorder) {
        let (pipeline, layout) = self.handles();
        rec.bind_pipeline(pipeline);
        if self.statics.iter().any(StaticUbo::is_populated) {
            let set = self.gpu.as_ref().map_or(vk::DescriptorSet::null(), |g| g.static_set);
            rec.bind_descriptor_sets(layout, 0, &[set], &[]);
        }
    }

    fn draw(&self, rec: &mut dyn CommandRecorder, subscriber: &PipelineSubscriber) {
        let (_, layout) = self.handles();

        let offsets = self
            .dynamics
            .iter()
            .zip(subscriber.dynamic_offsets)
            .filter(|(ubo, _)| ubo.is_populated())
            .map(|(_, offset)| offset)
            .collect::<Vec<_>>();
        if !offsets.is_empty() {
            let set = self.gpu.as_ref().map_or(vk::DescriptorSet::null(), |g| g.dynamic_set);
            rec.bind_descriptor_sets(layout, 1, &[set], &offsets);
        }

        if self.texture_count > 0
            && let Some(samplers) = self.sampler_sets.get(subscriber.sampler_set_index as usize)
            && !samplers.is_empty()
        {
            rec.bind_descriptor_sets(layout, 2, &[samplers.set()], &[]);
        }

        match self
            .geometry_sets
            .get(subscriber.geometry_set_index as usize)
            .and_then(Option::as_ref)
        {
            Some(geometry) => geometry.record_draw(rec),
            None => rec.draw(3, 1, 0, 0),
        }
    }

    /// Draws consecutive subscribers from `start` while their camera and
    /// level offsets stay equal, and returns where the next level resumes.
    pub fn render_level(&self, rec: &mut dyn CommandRecorder, start: usize) -> usize {
        let end = self.subscribers.len() - 1;
        if start >= end {
            return start;
        }

        self.bind(rec);
        let first = self.subscribers[start].dynamic_offsets;
        for i in start..end {
            let subscriber = &self.subscribers[i];
            if subscriber.dynamic_offsets[..=LEVEL_CUTOFF] != first[..=LEVEL_CUTOFF] {
                return i;
            }
            self.draw(rec, subscriber);
        }
        end
    }

    pub fn render_subscriber(&self, rec: &mut dyn CommandRecorder, subscriber: &PipelineSubscriber) {
        self.bind(rec);
        self.draw(rec, subscriber);
    }

    /// Creates layouts, descriptor sets and the graphics pipeline. Does
    /// nothing when already initialized; on failure nothing is kept.
    pub unsafe fn initialize(&mut self, device: &Arc<Device>, render_pass: vk::RenderPass) -> Result<()> {
        if self.gpu.is_some() {
            return Ok(());
        }

        match self.create_gpu(device, render_pass) {
            Ok(gpu) => {
                self.gpu = Some(gpu);
                log::debug!("Initialized pipeline {:016x}", self.hash);
                Ok(())
            }
            Err(e) => {
                self.uninitialize();
                Err(e)
            }
        }
    }

    /// Releases every device object. The host state survives.
    pub fn uninitialize(&mut self) {
        for samplers in &mut self.sampler_sets {
            samplers.take_set();
        }
        for shader in &mut self.shaders {
            shader.release();
        }
        self.gpu = None;
    }

    unsafe fn create_gpu(&mut self, device: &Arc<Device>, render_pass: vk::RenderPass) -> Result<PipelineGpu> {
        let polygon_mode = self.material.topology().polygon_mode()?;
        let mut gpu = PipelineGpu::new(device.clone());

        gpu.set_layouts[0] = create_set_layout(device, &ubo_bindings(&self.statics))?;
        gpu.set_layouts[1] = create_set_layout(device, &ubo_bindings(&self.dynamics))?;
        let mut layout_count = 2;
        if self.texture_count > 0 {
            let bindings = (0..self.texture_count)
                .map(|i| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(i as u32)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .descriptor_count(1)
                        .stage_flags(or_graphics(self.sampler_stage_flags(i)))
                        .build()
                })
                .collect::<Vec<_>>();
            gpu.set_layouts[2] = create_set_layout(device, &bindings)?;
            layout_count = 3;
        }

        let set_layouts = &gpu.set_layouts[..layout_count];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        gpu.layout = device.create_pipeline_layout(&info, None)?;

        gpu.static_set = gpu.allocate(gpu.set_layouts[0])?;
        gpu.dynamic_set = gpu.allocate(gpu.set_layouts[1])?;

        for shader in &mut self.shaders {
            shader.compile(device)?;
        }
        let stages = self.shaders.iter().map(Shader::stage_info).collect::<Vec<_>>();

        let (bindings, attributes) = self
            .shaders
            .iter()
            .find(|s| s.stage() == ShaderStage::Vertex)
            .map_or((&[][..], &[][..]), |s| (s.bindings(), s.attributes()));
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(bindings)
            .vertex_attribute_descriptions(attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.material.topology().vk_topology())
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = rasterization_state(polygon_mode);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth)
            .depth_write_enable(self.depth)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all())
            .blend_enable(self.blend == BlendMode::Alpha)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD);

        let attachments = &[attachment];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(gpu.layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)?;
        gpu.pipeline = pipelines.0[0];

        for shader in &mut self.shaders {
            shader.release();
        }
        Ok(gpu)
    }

    /// Mirrors this frame's uniforms to VRAM and writes every stale
    /// descriptor in one batch.
    pub unsafe fn upload(&mut self, vram: &Vram) -> Result<()> {
        let Some(gpu) = &mut self.gpu else {
            return Ok(());
        };

        let mut writes = Vec::new();
        for (binding, ubo) in self.statics.iter_mut().filter(|u| u.is_populated()).enumerate() {
            ubo.update(vram, gpu.static_set, binding as u32, &mut writes)?;
        }
        for (binding, ubo) in self.dynamics.iter_mut().filter(|u| u.is_populated()).enumerate() {
            ubo.update(vram, gpu.dynamic_set, binding as u32, &mut writes)?;
        }

        let mut image_writes: Vec<(vk::DescriptorSet, u32, vk::DescriptorImageInfo)> = Vec::new();
        if self.texture_count > 0 {
            for samplers in self.sampler_sets.iter_mut() {
                if samplers.is_empty() || samplers.is_written() {
                    continue;
                }
                if samplers.set() == vk::DescriptorSet::null() {
                    samplers.assign(gpu.allocate(gpu.set_layouts[2])?);
                }
                // Unfilled slots sample the first bound texture.
                let Some(fallback) = samplers.textures().iter().flatten().next() else {
                    continue;
                };
                for (binding, texture) in samplers.textures().iter().enumerate() {
                    let texture = texture.as_ref().unwrap_or(fallback);
                    image_writes.push((samplers.set(), binding as u32, texture.descriptor_info()));
                }
                samplers.mark_written();
            }
        }

        let buffer_writes = writes.iter().map(|w: &PendingWrite| {
            vk::WriteDescriptorSet::builder()
                .dst_set(w.set)
                .dst_binding(w.binding)
                .dst_array_element(0)
                .descriptor_type(w.descriptor_type)
                .buffer_info(std::slice::from_ref(&w.info))
                .build()
        });
        let sampler_writes = image_writes.iter().map(|(set, binding, info)| {
            vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(*binding)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(info))
                .build()
        });
        let all = buffer_writes.chain(sampler_writes).collect::<Vec<_>>();

        if !all.is_empty() {
            vram.device()
                .update_descriptor_sets(&all, &[] as &[vk::CopyDescriptorSet]);
        }
        Ok(())
    }
}

impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.shaders == other.shaders
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("blend", &self.blend)
            .field("depth", &self.depth)
            .field("subscribers", &self.subscribers().len())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Stages whose source mentions any of `symbols`.
fn stage_mask<S: AsRef<str>>(shaders: &[Shader], symbols: Vec<S>) -> vk::ShaderStageFlags {
    shaders
        .iter()
        .filter(|s| symbols.iter().any(|sym| s.uses(sym.as_ref())))
        .fold(vk::ShaderStageFlags::empty(), |mask, s| mask | s.stage().vk_flag())
}

/// Fixed rasterizer settings: back faces culled, counter-clockwise front.
fn rasterization_state(polygon_mode: vk::PolygonMode) -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(polygon_mode)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

fn same_geometry(a: &Option<Arc<GeometryContent>>, b: &Option<Arc<GeometryContent>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn or_graphics(flags: vk::ShaderStageFlags) -> vk::ShaderStageFlags {
    if flags.is_empty() {
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
    } else {
        flags
    }
}

fn ubo_bindings<K: UboKind>(ubos: &[crate::ubo::DataUbo<K>]) -> Vec<vk::DescriptorSetLayoutBinding> {
    ubos.iter()
        .filter(|u| u.is_populated())
        .enumerate()
        .map(|(binding, ubo)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding as u32)
                .descriptor_type(K::DESCRIPTOR_TYPE)
                .descriptor_count(1)
                .stage_flags(or_graphics(ubo.stage_flags()))
                .build()
        })
        .collect()
}

unsafe fn create_set_layout(
    device: &Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
    Ok(device.create_descriptor_set_layout(&info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Mesh, Texture};
    use crate::recorder::{Command, CommandLog};
    use crate::traits::TraitTag;

    const FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::D32_SFLOAT];

    fn triangle() -> Arc<Mesh> {
        Arc::new(
            Mesh::new(Topology::Triangles)
                .with_places(&[[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]])
                .with_samplers(&[[0.0, 0.0], [1.0, 0.0], [0.5, 1.0]]),
        )
    }

    fn textured() -> Pipeline {
        let descriptor = Descriptor::default()
            .with(DescriptorItem::Mesh(triangle()))
            .with(DescriptorItem::Texture(Arc::new(Texture::solid([255, 0, 0, 255]))));
        Pipeline::from_descriptor(&descriptor, &FORMATS, 256).unwrap()
    }

    fn texture(hash: u64) -> Arc<TextureContent> {
        Arc::new(TextureContent::from_raw(
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Sampler::null(),
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 1, height: 1 },
            hash,
        ))
    }

    #[test]
    fn back_faces_are_culled() {
        let state = rasterization_state(vk::PolygonMode::FILL);
        assert_eq!(state.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(state.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(state.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(state.line_width, 1.0);
    }

    #[test]
    fn equal_descriptors_give_equal_pipelines() {
        let a = textured();
        let b = textured();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);

        let opaque = Pipeline::from_descriptor(
            &Descriptor::default()
                .with(DescriptorItem::Mesh(triangle()))
                .with(DescriptorItem::Texture(Arc::new(Texture::solid([255, 0, 0, 255]))))
                .with(DescriptorItem::Blend(BlendMode::Opaque)),
            &FORMATS,
            256,
        )
        .unwrap();
        assert_ne!(a.hash(), opaque.hash());
    }

    #[test]
    fn hierarchical_layers_disable_depth() {
        let pipeline = Pipeline::from_descriptor(
            &Descriptor::default()
                .with(DescriptorItem::Mesh(triangle()))
                .with(DescriptorItem::Layer(Style::HIERARCHICAL)),
            &FORMATS,
            256,
        )
        .unwrap();
        assert!(!pipeline.depth());
        assert!(textured().depth());
    }

    #[test]
    fn empty_descriptors_are_invalid() {
        let result = Pipeline::from_descriptor(&Descriptor::default(), &FORMATS, 256);
        assert!(matches!(result, Err(Error::InvalidPipeline)));
    }

    #[test]
    fn inline_sources_build_code_materials() {
        let descriptor = Descriptor::default()
            .with(DescriptorItem::ShaderSource {
                stage: ShaderStage::Vertex,
                source: "void main() { gl_Position = vec4(Time); }".to_string(),
            })
            .with(DescriptorItem::ShaderSource {
                stage: ShaderStage::Pixel,
                source: "void main() {}".to_string(),
            });
        let pipeline = Pipeline::from_descriptor(&descriptor, &FORMATS, 256).unwrap();
        assert_eq!(pipeline.shaders().len(), 2);
        let time = pipeline.static_ubo(Rate::PerTick).unwrap();
        assert!(time.is_populated());
        assert_eq!(time.stage_flags(), vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn stage_masks_follow_symbol_usage() {
        let pipeline = textured();
        let instance = pipeline.dynamic_ubo(Rate::PerInstance).unwrap();
        assert_eq!(instance.stage_flags(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(pipeline.sampler_stage_flags(0), vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn two_instances_share_one_renderable_set() {
        let mut pipeline = textured();
        let geometry = Arc::new(GeometryContent::placeholder(&triangle()));
        pipeline.set_geometry(Some(geometry));
        pipeline.set_texture(0, Some(texture(1)));

        for x in [0.0, 1.0] {
            pipeline.set_uniform(&Trait::mat4(
                TraitTag::Transformation,
                glam::Mat4::from_translation(glam::vec3(x, 0.0, 0.0)),
            ));
            assert!(pipeline.push_uniforms(Rate::PerInstance, true).is_some());
        }
        pipeline.push_uniforms(Rate::PerRenderable, true);

        assert_eq!(pipeline.subscribers().len(), 2);
        assert_eq!(pipeline.sampler_sets().len(), 2);
        assert_eq!(pipeline.geometry_sets().len(), 2);
        for subscriber in pipeline.subscribers() {
            assert_eq!(subscriber.sampler_set_index, 1);
            assert_eq!(subscriber.geometry_set_index, 1);
        }
        assert_ne!(
            pipeline.subscribers()[0].dynamic_offsets[3],
            pipeline.subscribers()[1].dynamic_offsets[3]
        );

        let mut log = CommandLog::default();
        assert_eq!(pipeline.render_level(&mut log, 0), 2);
        assert_eq!(log.draws(), 2);
        assert_eq!(log.pipeline_binds(), 1);
    }

    #[test]
    fn adjacent_duplicates_are_not_materialized() {
        let mut pipeline = textured();
        let shared = texture(7);
        for _ in 0..3 {
            pipeline.set_texture(0, Some(shared.clone()));
            pipeline.push_uniforms(Rate::PerInstance, true);
            pipeline.push_uniforms(Rate::PerRenderable, true);
        }
        assert_eq!(pipeline.sampler_sets().len(), 2);

        pipeline.set_texture(0, Some(texture(8)));
        pipeline.push_uniforms(Rate::PerRenderable, true);
        pipeline.set_texture(0, Some(shared));
        pipeline.push_uniforms(Rate::PerRenderable, true);
        assert_eq!(pipeline.sampler_sets().len(), 4);

        for pair in pipeline.sampler_sets().windows(2) {
            assert!(pair[0] != pair[1]);
        }
    }

    #[test]
    fn reset_leaves_one_of_each() {
        let mut pipeline = textured();
        for i in 0..4 {
            pipeline.set_texture(0, Some(texture(i)));
            pipeline.push_uniforms(Rate::PerInstance, true);
            pipeline.push_uniforms(Rate::PerRenderable, true);
        }
        pipeline.reset_uniforms();

        assert!(pipeline.subscribers().is_empty());
        assert_eq!(pipeline.sampler_sets().len(), 1);
        assert_eq!(pipeline.geometry_sets().len(), 1);
        assert_eq!(pipeline.dynamic_ubo(Rate::PerInstance).unwrap().used_count(), 0);
    }

    #[test]
    fn levels_split_batches() {
        let mut pipeline = textured();
        for _ in 0..2 {
            pipeline.push_uniforms(Rate::PerInstance, true);
        }
        pipeline.push_uniforms(Rate::PerRenderable, true);
        pipeline.push_uniforms(Rate::PerLevel, true);
        pipeline.push_uniforms(Rate::PerInstance, true);
        pipeline.push_uniforms(Rate::PerRenderable, true);
        pipeline.push_uniforms(Rate::PerLevel, true);

        let mut log = CommandLog::default();
        let next = pipeline.render_level(&mut log, 0);
        assert_eq!(next, 2);
        assert_eq!(log.draws(), 2);
        assert_eq!(pipeline.render_level(&mut log, next), 3);
        assert_eq!(log.draws(), 3);
        assert_eq!(pipeline.render_level(&mut log, 3), 3);
        assert_eq!(log.pipeline_binds(), 2);
    }

    #[test]
    fn unsubscribed_pushes_fill_one_slot() {
        let mut pipeline = textured();
        let a = pipeline.push_uniforms(Rate::PerInstance, false).unwrap();
        let b = pipeline.push_uniforms(Rate::PerInstance, false).unwrap();
        assert_ne!(a, b);
        assert!(pipeline.subscribers().is_empty());

        let mut log = CommandLog::default();
        pipeline.render_subscriber(&mut log, &b);
        assert_eq!(log.draws(), 1);
    }

    #[test]
    fn static_pushes_are_ignored() {
        let mut pipeline = textured();
        assert_eq!(pipeline.push_uniforms(Rate::PerTick, true), None);
        assert!(pipeline.subscribers().is_empty());
    }

    #[test]
    fn draws_bind_only_populated_offsets() {
        let mut pipeline = textured();
        pipeline.set_geometry(Some(Arc::new(GeometryContent::placeholder(&triangle()))));
        pipeline.push_uniforms(Rate::PerInstance, true);
        pipeline.push_uniforms(Rate::PerRenderable, true);

        let mut log = CommandLog::default();
        pipeline.render_level(&mut log, 0);
        let populated = Rate::DYNAMIC
            .iter()
            .filter(|r| pipeline.dynamic_ubo(**r).is_some_and(|u| u.is_populated()))
            .count();
        let bound = log.commands.iter().find_map(|c| match c {
            Command::BindDescriptorSets { first_set: 1, dynamic_offsets, .. } => {
                Some(dynamic_offsets.len())
            }
            _ => None,
        });
        assert_eq!(bound, Some(populated));
        assert!(matches!(
            log.commands.last(),
            Some(Command::Draw { vertex_count: 3, first_vertex: 0, .. })
        ));
    }
}
