use std::sync::Arc;

use crate::content::{GeometryContent, TextureContent};
use crate::context::{PipelineId, RenderContext};
use crate::descriptor::{self, Descriptor, DescriptorItem};
use crate::error::Result;
use crate::layer::Style;
use crate::lod::{Level, Lod, LOD_CACHE_SIZE};
use crate::scene::Instance;
use crate::traits::{Trait, TraitTag};

#[derive(Clone, Debug, Default)]
struct LodSlot {
    geometry: Option<Option<Arc<GeometryContent>>>,
    textures: Option<Vec<Arc<TextureContent>>>,
    pipeline: Option<PipelineId>,
}

/// Something drawable: meshes, textures, colors, shaders or a material,
/// resolved lazily per level of detail.
#[derive(Clone, Debug)]
pub struct Renderable {
    items: Vec<DescriptorItem>,
    /// Set through `set_pipeline`; survives refreshes.
    owned: Option<PipelineId>,
    predefined: Option<PipelineId>,
    /// Levels any instance seen at the last refresh is visible at.
    level_range: (Level, Level),
    stale: bool,
    lods: [LodSlot; LOD_CACHE_SIZE],
}

impl Default for Renderable {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            owned: None,
            predefined: None,
            level_range: (Level::DEFAULT, Level::DEFAULT),
            stale: true,
            lods: Default::default(),
        }
    }
}

impl Renderable {
    pub fn new(items: Vec<DescriptorItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with(mut self, item: DescriptorItem) -> Self {
        self.items.push(item);
        self.lods = Default::default();
        self.stale = true;
        self
    }

    pub fn items(&self) -> &[DescriptorItem] {
        &self.items
    }

    /// Uses `pipeline` at every level, bypassing generation.
    pub fn set_pipeline(&mut self, pipeline: PipelineId) {
        self.owned = Some(pipeline);
        self.predefined = Some(pipeline);
    }

    pub fn predefined(&self) -> Option<PipelineId> {
        self.predefined
    }

    /// Whether the instances changed since the last refresh.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn level_range(&self) -> (Level, Level) {
        self.level_range
    }

    /// False when no instance can be seen at `level`. Without instances
    /// only the default level is observed.
    pub fn observes(&self, level: Level) -> bool {
        let (coarsest, finest) = self.level_range;
        coarsest <= level && level <= finest
    }

    /// Forgets cached content and takes the level range of `instances`,
    /// the instances gathered from its owners. An owned pipeline, or else
    /// an owned material, becomes the predefined pipeline.
    pub fn refresh(&mut self, instances: &[Instance], ctx: &mut dyn RenderContext) -> Result<()> {
        self.lods = Default::default();
        self.stale = false;
        self.level_range = instances
            .iter()
            .map(|i| i.level_range)
            .reduce(|(c0, f0), (c1, f1)| (c0.min(c1), f0.max(f1)))
            .unwrap_or((Level::DEFAULT, Level::DEFAULT));

        self.predefined = self.owned;
        if self.predefined.is_some() {
            return Ok(());
        }

        let material = self
            .items
            .iter()
            .find(|item| matches!(item, DescriptorItem::Material(_)));
        if let Some(material) = material {
            let mut descriptor = Descriptor::default().with(material.clone());
            for item in &self.items {
                if matches!(item, DescriptorItem::Blend(_) | DescriptorItem::Layer(_)) {
                    descriptor = descriptor.with(item.clone());
                }
            }
            self.predefined = Some(ctx.pipeline_for(&descriptor)?);
        }
        Ok(())
    }

    pub fn get_pipeline(&mut self, lod: &Lod, style: Style, ctx: &mut dyn RenderContext) -> Result<PipelineId> {
        if let Some(id) = self.predefined {
            return Ok(id);
        }

        let slot = &mut self.lods[lod.level.index()];
        if let Some(id) = slot.pipeline {
            return Ok(id);
        }

        let descriptor = Descriptor::new(self.items.clone()).with(DescriptorItem::Layer(style));
        let id = ctx.pipeline_for(&descriptor)?;
        slot.pipeline = Some(id);
        Ok(id)
    }

    pub fn geometry(&mut self, lod: &Lod, ctx: &mut dyn RenderContext) -> Result<Option<Arc<GeometryContent>>> {
        let slot = &mut self.lods[lod.level.index()];
        if let Some(geometry) = &slot.geometry {
            return Ok(geometry.clone());
        }

        let geometry = match descriptor::mesh_of(&self.items) {
            Some(mesh) => Some(ctx.geometry_for(&mesh)?),
            None => None,
        };
        slot.geometry = Some(geometry.clone());
        Ok(geometry)
    }

    pub fn textures(&mut self, lod: &Lod, ctx: &mut dyn RenderContext) -> Result<Vec<Arc<TextureContent>>> {
        let slot = &mut self.lods[lod.level.index()];
        if let Some(textures) = &slot.textures {
            return Ok(textures.clone());
        }

        let textures = descriptor::textures_of(&self.items)?
            .iter()
            .map(|t| ctx.texture_for(t))
            .collect::<Result<Vec<_>>>()?;
        slot.textures = Some(textures.clone());
        Ok(textures)
    }

    /// Per-renderable uniform values.
    pub fn uniforms(&self) -> Vec<Trait> {
        descriptor::colors_of(&self.items)
            .first()
            .map(|c| Trait::vec4(TraitTag::Color, *c))
            .into_iter()
            .collect()
    }
}
