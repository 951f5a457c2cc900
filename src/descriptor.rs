//! Heterogeneous pipeline requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Vec4;

use crate::asset::{Mesh, Texture};
use crate::error::Result;
use crate::layer::Style;
use crate::material::Material;
use crate::shader::ShaderStage;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// `SRC_ALPHA, ONE_MINUS_SRC_ALPHA` color blending.
    #[default]
    Alpha,
    Opaque,
}

#[derive(Clone, Debug)]
pub enum DescriptorItem {
    /// GLSL file whose extension names the stage.
    ShaderFile(PathBuf),
    /// Any file: a shader when the extension names a stage, else an image.
    FilePath(PathBuf),
    ShaderSource { stage: ShaderStage, source: String },
    Material(Arc<Material>),
    Texture(Arc<Texture>),
    Mesh(Arc<Mesh>),
    Color(Vec4),
    Layer(Style),
    Blend(BlendMode),
    Construct(Vec<DescriptorItem>),
}

impl DescriptorItem {
    /// Stage of a shader file item, judged by extension.
    pub fn shader_stage(&self) -> Option<ShaderStage> {
        match self {
            DescriptorItem::ShaderFile(path) | DescriptorItem::FilePath(path) => stage_of(path),
            DescriptorItem::ShaderSource { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

fn stage_of(path: &Path) -> Option<ShaderStage> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(ShaderStage::from_extension)
}

#[derive(Clone, Debug, Default)]
pub struct Descriptor {
    items: Vec<DescriptorItem>,
}

impl Descriptor {
    pub fn new(items: Vec<DescriptorItem>) -> Self {
        Self { items }
    }

    pub fn with(mut self, item: DescriptorItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn items(&self) -> &[DescriptorItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Items of `items`, with constructs flattened depth-first.
pub fn flatten(items: &[DescriptorItem]) -> Vec<&DescriptorItem> {
    let mut flat = Vec::new();
    for item in items {
        match item {
            DescriptorItem::Construct(inner) => flat.extend(flatten(inner)),
            other => flat.push(other),
        }
    }
    flat
}

/// First mesh found among `items`.
pub fn mesh_of(items: &[DescriptorItem]) -> Option<Arc<Mesh>> {
    flatten(items).into_iter().find_map(|item| match item {
        DescriptorItem::Mesh(mesh) => Some(mesh.clone()),
        _ => None,
    })
}

/// Every texture of `items`. Image files are decoded on the way.
pub fn textures_of(items: &[DescriptorItem]) -> Result<Vec<Arc<Texture>>> {
    let mut textures = Vec::new();
    for item in flatten(items) {
        match item {
            DescriptorItem::Texture(texture) => textures.push(texture.clone()),
            DescriptorItem::FilePath(path) if stage_of(path).is_none() => {
                textures.push(Arc::new(Texture::open(path)?));
            }
            _ => {}
        }
    }
    Ok(textures)
}

pub fn colors_of(items: &[DescriptorItem]) -> Vec<Vec4> {
    flatten(items)
        .into_iter()
        .filter_map(|item| match item {
            DescriptorItem::Color(color) => Some(*color),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Topology;

    #[test]
    fn constructs_flatten_in_order() {
        let mesh = Arc::new(Mesh::new(Topology::Points));
        let items = vec![
            DescriptorItem::Color(Vec4::ONE),
            DescriptorItem::Construct(vec![
                DescriptorItem::Mesh(mesh.clone()),
                DescriptorItem::Construct(vec![DescriptorItem::Color(Vec4::ZERO)]),
            ]),
        ];
        assert_eq!(flatten(&items).len(), 3);
        assert!(mesh_of(&items).is_some_and(|m| Arc::ptr_eq(&m, &mesh)));
        assert_eq!(colors_of(&items), vec![Vec4::ONE, Vec4::ZERO]);
    }

    #[test]
    fn file_stages_come_from_extensions() {
        let frag = DescriptorItem::FilePath(PathBuf::from("shaders/unlit.frag"));
        let image = DescriptorItem::FilePath(PathBuf::from("textures/ferris.png"));
        assert_eq!(frag.shader_stage(), Some(ShaderStage::Pixel));
        assert_eq!(image.shader_stage(), None);
    }

    #[test]
    fn missing_image_files_fail_to_load() {
        let items = vec![DescriptorItem::FilePath(PathBuf::from("does/not/exist.png"))];
        assert!(textures_of(&items).is_err());
    }
}
