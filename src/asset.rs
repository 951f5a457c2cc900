//! Host-side meshes and textures, before they are uploaded.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use bytemuck::Pod;
use vulkanalia::vk;

use crate::error::{Error, Result};
use crate::traits::{DataType, Scalar, TraitTag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
    Patches,
}

impl Topology {
    pub fn vk_topology(self) -> vk::PrimitiveTopology {
        match self {
            Topology::Points => vk::PrimitiveTopology::POINT_LIST,
            Topology::Lines => vk::PrimitiveTopology::LINE_LIST,
            Topology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Topology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Topology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
            Topology::Patches => vk::PrimitiveTopology::PATCH_LIST,
        }
    }

    pub fn polygon_mode(self) -> Result<vk::PolygonMode> {
        match self {
            Topology::Points => Ok(vk::PolygonMode::POINT),
            Topology::Lines | Topology::LineStrip => Ok(vk::PolygonMode::LINE),
            Topology::Triangles | Topology::TriangleStrip | Topology::TriangleFan => {
                Ok(vk::PolygonMode::FILL)
            }
            Topology::Patches => Err(Error::UnsupportedTopology(self)),
        }
    }
}

/// How texture coordinates are obtained for a mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureMapping {
    /// Taken verbatim from the `Sampler` attribute.
    #[default]
    Custom,
    /// Derived from the model-space position.
    World,
    /// Derived from the projected screen position.
    Screen,
}

/// One vertex stream: a tag, its element layout and tightly packed data.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct Attribute {
    pub tag: TraitTag,
    pub ty: DataType,
    pub bytes: Vec<u8>,
}

impl Attribute {
    pub fn count(&self) -> u32 {
        match self.ty.stride() {
            0 => 0,
            stride => (self.bytes.len() as u64 / stride) as u32,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Mesh {
    topology: Topology,
    attributes: Vec<Attribute>,
    indices: Option<Vec<u32>>,
    mapping: TextureMapping,
    hash: u64,
}

impl Mesh {
    pub fn new(topology: Topology) -> Self {
        let mut mesh = Self {
            topology,
            attributes: Vec::new(),
            indices: None,
            mapping: TextureMapping::Custom,
            hash: 0,
        };
        mesh.rehash();
        mesh
    }

    pub fn with_attribute<T: Pod>(mut self, tag: TraitTag, ty: DataType, data: &[T]) -> Self {
        self.attributes.push(Attribute {
            tag,
            ty,
            bytes: bytemuck::cast_slice(data).to_vec(),
        });
        self.rehash();
        self
    }

    pub fn with_places(self, places: &[[f32; 3]]) -> Self {
        self.with_attribute(TraitTag::Place, DataType::vector(Scalar::F32, 3), places)
    }

    pub fn with_samplers(self, samplers: &[[f32; 2]]) -> Self {
        self.with_attribute(TraitTag::Sampler, DataType::vector(Scalar::F32, 2), samplers)
    }

    pub fn with_colors(self, colors: &[[f32; 4]]) -> Self {
        self.with_attribute(TraitTag::Color, DataType::vector(Scalar::F32, 4), colors)
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self.rehash();
        self
    }

    pub fn with_mapping(mut self, mapping: TextureMapping) -> Self {
        self.mapping = mapping;
        self.rehash();
        self
    }

    fn rehash(&mut self) {
        let mut hasher = DefaultHasher::new();
        self.topology.hash(&mut hasher);
        self.attributes.hash(&mut hasher);
        self.indices.hash(&mut hasher);
        self.mapping.hash(&mut hasher);
        self.hash = hasher.finish();
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn indices(&self) -> Option<&[u32]> {
        self.indices.as_deref()
    }

    pub fn mapping(&self) -> TextureMapping {
        self.mapping
    }

    /// Vertices in the shortest attribute stream.
    pub fn vertex_count(&self) -> u32 {
        self.attributes
            .iter()
            .filter(|a| a.tag != TraitTag::Index)
            .map(Attribute::count)
            .min()
            .unwrap_or(0)
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Bytes per texel for the formats textures may arrive in.
pub fn bytes_per_pixel(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => Some(2),
        vk::Format::R8G8B8_UNORM
        | vk::Format::R8G8B8_SRGB
        | vk::Format::B8G8R8_UNORM
        | vk::Format::B8G8R8_SRGB => Some(3),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct Texture {
    width: u32,
    height: u32,
    format: vk::Format,
    pixels: Vec<u8>,
    hash: u64,
}

impl Texture {
    pub fn from_pixels(width: u32, height: u32, format: vk::Format, pixels: Vec<u8>) -> Result<Self> {
        let bpp = bytes_per_pixel(format).ok_or(Error::UnsupportedFormat(format))?;
        let expected = width as usize * height as usize * bpp;
        if pixels.len() != expected {
            return Err(Error::TextureSize {
                expected,
                actual: pixels.len(),
            });
        }

        let mut hasher = DefaultHasher::new();
        (width, height, format.as_raw()).hash(&mut hasher);
        pixels.hash(&mut hasher);

        Ok(Self {
            width,
            height,
            format,
            pixels,
            hash: hasher.finish(),
        })
    }

    /// Decodes an image file into sRGB RGBA8.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let img = image::open(path)?.to_rgba8();
        let (width, height) = (img.width(), img.height());
        Self::from_pixels(width, height, vk::Format::R8G8B8A8_SRGB, img.into_raw())
    }

    /// A single texel of the given color.
    pub fn solid(rgba: [u8; 4]) -> Self {
        let mut hasher = DefaultHasher::new();
        (1u32, 1u32, vk::Format::R8G8B8A8_UNORM.as_raw()).hash(&mut hasher);
        rgba.to_vec().hash(&mut hasher);
        Self {
            width: 1,
            height: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            pixels: rgba.to_vec(),
            hash: hasher.finish(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_hash_follows_content() {
        let a = Mesh::new(Topology::Triangles).with_places(&[[0.0; 3]; 3]);
        let b = Mesh::new(Topology::Triangles).with_places(&[[0.0; 3]; 3]);
        let c = Mesh::new(Topology::Triangles).with_places(&[[1.0; 3]; 3]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.vertex_count(), 3);
        assert_ne!(a.hash(), a.clone().with_mapping(TextureMapping::World).hash());
    }

    #[test]
    fn patches_have_no_polygon_mode() {
        assert!(matches!(
            Topology::Patches.polygon_mode(),
            Err(Error::UnsupportedTopology(Topology::Patches))
        ));
        assert_eq!(Topology::Lines.polygon_mode().unwrap(), vk::PolygonMode::LINE);
    }

    #[test]
    fn texture_size_is_checked() {
        assert!(Texture::from_pixels(2, 1, vk::Format::R8G8B8_UNORM, vec![0; 6]).is_ok());
        assert!(matches!(
            Texture::from_pixels(2, 1, vk::Format::R8G8B8_UNORM, vec![0; 5]),
            Err(Error::TextureSize {
                expected: 6,
                actual: 5
            })
        ));
        assert!(matches!(
            Texture::from_pixels(1, 1, vk::Format::BC1_RGB_UNORM_BLOCK, vec![]),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn solid_matches_from_pixels() {
        let solid = Texture::solid([255, 0, 0, 255]);
        let explicit =
            Texture::from_pixels(1, 1, vk::Format::R8G8B8A8_UNORM, vec![255, 0, 0, 255]).unwrap();
        assert_eq!(solid.hash(), explicit.hash());
    }
}
