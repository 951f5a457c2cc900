//! What layers and renderables need from whoever owns the pipelines.

use std::collections::HashMap;
use std::sync::Arc;

use vulkanalia::vk;

use crate::asset::{Mesh, Texture};
use crate::content::{GeometryContent, TextureContent};
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::pipeline::Pipeline;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(usize);

impl PipelineId {
    pub fn index(self) -> usize {
        self.0
    }
}

pub trait RenderContext {
    fn window_extent(&self) -> vk::Extent2D;
    fn min_ubo_alignment(&self) -> u64;
    /// Formats of the render pass attachments, color first.
    fn attachment_formats(&self) -> &[vk::Format];
    /// An existing pipeline equal to the one `descriptor` describes, or a new one.
    fn pipeline_for(&mut self, descriptor: &Descriptor) -> Result<PipelineId>;
    fn pipeline(&self, id: PipelineId) -> &Pipeline;
    fn pipeline_mut(&mut self, id: PipelineId) -> &mut Pipeline;
    fn geometry_for(&mut self, mesh: &Arc<Mesh>) -> Result<Arc<GeometryContent>>;
    fn texture_for(&mut self, texture: &Arc<Texture>) -> Result<Arc<TextureContent>>;
}

/// Pipelines indexed by id and cached by hash.
#[derive(Debug, Default)]
pub struct PipelineStore {
    pipelines: Vec<Pipeline>,
    by_hash: HashMap<u64, PipelineId>,
}

impl PipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the pipeline for `descriptor` unless an equal one is cached.
    /// The second value tells whether the pipeline is new.
    pub fn request(
        &mut self,
        descriptor: &Descriptor,
        attachment_formats: &[vk::Format],
        min_ubo_alignment: u64,
    ) -> Result<(PipelineId, bool)> {
        let pipeline = Pipeline::from_descriptor(descriptor, attachment_formats, min_ubo_alignment)?;
        if let Some(id) = self.by_hash.get(&pipeline.hash())
            && self.pipelines[id.0] == pipeline
        {
            return Ok((*id, false));
        }
        Ok((self.insert(pipeline), true))
    }

    pub fn insert(&mut self, pipeline: Pipeline) -> PipelineId {
        let id = PipelineId(self.pipelines.len());
        log::debug!("Caching pipeline {:016x} as #{}", pipeline.hash(), id.0);
        self.by_hash.insert(pipeline.hash(), id);
        self.pipelines.push(pipeline);
        id
    }

    pub fn get(&self, id: PipelineId) -> &Pipeline {
        &self.pipelines[id.0]
    }

    pub fn get_mut(&mut self, id: PipelineId) -> &mut Pipeline {
        &mut self.pipelines[id.0]
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pipeline> {
        self.pipelines.iter_mut()
    }

    /// Releases every pipeline's device objects, newest first.
    pub fn clear(&mut self) {
        while let Some(mut pipeline) = self.pipelines.pop() {
            pipeline.uninitialize();
        }
        self.by_hash.clear();
    }
}

/// A context without a device. Content gets null handles and pipelines are
/// never initialized, so scenes can be compiled and recorded on the host.
pub struct HostContext {
    extent: vk::Extent2D,
    min_ubo_alignment: u64,
    formats: Vec<vk::Format>,
    store: PipelineStore,
    geometry: HashMap<u64, Arc<GeometryContent>>,
    textures: HashMap<u64, Arc<TextureContent>>,
}

impl HostContext {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            extent,
            min_ubo_alignment: 256,
            formats: vec![vk::Format::B8G8R8A8_UNORM, vk::Format::D32_SFLOAT],
            store: PipelineStore::new(),
            geometry: HashMap::new(),
            textures: HashMap::new(),
        }
    }

    pub fn with_min_ubo_alignment(mut self, alignment: u64) -> Self {
        self.min_ubo_alignment = alignment;
        self
    }

    pub fn set_extent(&mut self, extent: vk::Extent2D) {
        self.extent = extent;
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PipelineStore {
        &mut self.store
    }
}

impl RenderContext for HostContext {
    fn window_extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn min_ubo_alignment(&self) -> u64 {
        self.min_ubo_alignment
    }

    fn attachment_formats(&self) -> &[vk::Format] {
        &self.formats
    }

    fn pipeline_for(&mut self, descriptor: &Descriptor) -> Result<PipelineId> {
        let (id, _) = self
            .store
            .request(descriptor, &self.formats, self.min_ubo_alignment)?;
        Ok(id)
    }

    fn pipeline(&self, id: PipelineId) -> &Pipeline {
        self.store.get(id)
    }

    fn pipeline_mut(&mut self, id: PipelineId) -> &mut Pipeline {
        self.store.get_mut(id)
    }

    fn geometry_for(&mut self, mesh: &Arc<Mesh>) -> Result<Arc<GeometryContent>> {
        Ok(self
            .geometry
            .entry(mesh.hash())
            .or_insert_with(|| Arc::new(GeometryContent::placeholder(mesh)))
            .clone())
    }

    fn texture_for(&mut self, texture: &Arc<Texture>) -> Result<Arc<TextureContent>> {
        Ok(self
            .textures
            .entry(texture.hash())
            .or_insert_with(|| Arc::new(TextureContent::placeholder(texture)))
            .clone())
    }
}
