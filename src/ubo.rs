//! Host-side packing of uniforms into GPU-aligned blocks.

use std::marker::PhantomData;
use std::sync::Arc;

use vulkanalia::prelude::v1_3::*;

use crate::content::TextureContent;
use crate::error::{Error, Result};
use crate::gpu::GpuBuffer;
use crate::rate::Rate;
use crate::traits::{align_up, DataType, Trait};
use crate::vram::Vram;

/// Offsets of `types` laid out back to back, and the end of the last one.
pub fn pack(types: &[&DataType]) -> Option<(Vec<u64>, u64)> {
    let mut cursor = 0;
    let mut offsets = Vec::with_capacity(types.len());
    for ty in types {
        if ty.is_abstract() {
            return None;
        }
        let offset = align_up(cursor, ty.base_alignment());
        offsets.push(offset);
        cursor = offset + ty.stride();
    }
    Some((offsets, cursor))
}

#[derive(Clone, Debug, PartialEq)]
pub struct Uniform {
    pub offset: u64,
    pub value: Trait,
}

impl Uniform {
    pub fn size(&self) -> u64 {
        self.value.data_type().stride()
    }
}

pub trait UboKind {
    const DYNAMIC: bool;
    const DESCRIPTOR_TYPE: vk::DescriptorType;
}

/// Written rarely; one block bound from set 0.
pub enum Static {}

/// Grows by one block per push; bound from set 1 with dynamic offsets.
pub enum Dynamic {}

impl UboKind for Static {
    const DYNAMIC: bool = false;
    const DESCRIPTOR_TYPE: vk::DescriptorType = vk::DescriptorType::UNIFORM_BUFFER;
}

impl UboKind for Dynamic {
    const DYNAMIC: bool = true;
    const DESCRIPTOR_TYPE: vk::DescriptorType = vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC;
}

/// A descriptor write waiting for its buffer info to be assembled.
#[derive(Clone, Copy, Debug)]
pub struct PendingWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub info: vk::DescriptorBufferInfo,
}

pub type StaticUbo = DataUbo<Static>;
pub type DynamicUbo = DataUbo<Dynamic>;

pub struct DataUbo<K: UboKind> {
    rate: Rate,
    uniforms: Vec<Uniform>,
    stride: u64,
    ram: Vec<u8>,
    used_count: u64,
    stage_flags: vk::ShaderStageFlags,
    buffer: Option<GpuBuffer>,
    _kind: PhantomData<K>,
}

impl<K: UboKind> DataUbo<K> {
    pub fn new(rate: Rate, values: Vec<Trait>) -> Self {
        Self {
            rate,
            uniforms: values
                .into_iter()
                .map(|value| Uniform { offset: 0, value })
                .collect(),
            stride: 0,
            ram: Vec::new(),
            used_count: 0,
            stage_flags: vk::ShaderStageFlags::empty(),
            buffer: None,
            _kind: PhantomData,
        }
    }

    /// Assigns aligned offsets and rounds the block up to `min_alignment`.
    pub fn calculate_sizes(&mut self, min_alignment: u64) -> Result<()> {
        if let Some(u) = self.uniforms.iter().find(|u| u.value.data_type().is_abstract()) {
            return Err(Error::AbstractUniform(u.value.tag()));
        }

        let types = self
            .uniforms
            .iter()
            .map(|u| u.value.data_type())
            .collect::<Vec<_>>();
        let (offsets, cursor) = pack(&types).ok_or(Error::Unimplemented("abstract uniform"))?;
        for (uniform, offset) in self.uniforms.iter_mut().zip(offsets) {
            uniform.offset = offset;
        }

        self.stride = if self.uniforms.is_empty() {
            0
        } else {
            align_up(cursor, min_alignment.max(1))
        };
        self.ram = vec![0; self.stride as usize];
        Ok(())
    }

    /// Writes `value` into the block currently being filled. Returns whether
    /// a uniform with that tag exists.
    pub fn set(&mut self, value: &Trait) -> bool {
        let Some(bytes) = value.payload() else {
            return false;
        };
        let base = self.current_block() * self.stride;
        let Some(uniform) = self.uniforms.iter().find(|u| u.value.tag() == value.tag()) else {
            return false;
        };

        let start = (base + uniform.offset) as usize;
        let len = bytes.len().min(uniform.size() as usize);
        if start + len <= self.ram.len() {
            self.ram[start..start + len].copy_from_slice(&bytes[..len]);
        }
        true
    }

    fn current_block(&self) -> u64 {
        if K::DYNAMIC {
            self.used_count
        } else {
            0
        }
    }

    /// Reads back the bytes of `tag` in block `block`.
    pub fn read(&self, block: u64, tag: crate::traits::TraitTag) -> Option<&[u8]> {
        let uniform = self.uniforms.iter().find(|u| u.value.tag() == tag)?;
        let start = (block * self.stride + uniform.offset) as usize;
        self.ram.get(start..start + uniform.size() as usize)
    }

    pub fn is_populated(&self) -> bool {
        !self.uniforms.is_empty()
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn uniforms(&self) -> &[Uniform] {
        &self.uniforms
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        self.stage_flags
    }

    pub fn set_stage_flags(&mut self, flags: vk::ShaderStageFlags) {
        self.stage_flags = flags;
    }

    pub fn buffer(&self) -> Option<&GpuBuffer> {
        self.buffer.as_ref()
    }

    fn upload_len(&self) -> u64 {
        if K::DYNAMIC {
            self.used_count * self.stride
        } else {
            self.stride
        }
    }

    /// Mirrors the RAM block(s) to VRAM and queues the descriptor write.
    pub unsafe fn update(
        &mut self,
        vram: &Vram,
        set: vk::DescriptorSet,
        binding: u32,
        writes: &mut Vec<PendingWrite>,
    ) -> Result<()> {
        if !self.is_populated() {
            return Ok(());
        }

        let needed = self.ram.len() as u64;
        if self.buffer.as_ref().is_none_or(|b| b.size() < needed) {
            self.buffer = Some(vram.create_buffer(
                needed,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?);
        }

        let Some(buffer) = &self.buffer else {
            return Ok(());
        };
        buffer.write(0, &self.ram[..self.upload_len() as usize])?;

        writes.push(PendingWrite {
            set,
            binding,
            descriptor_type: K::DESCRIPTOR_TYPE,
            info: vk::DescriptorBufferInfo::builder()
                .buffer(buffer.handle())
                .offset(0)
                .range(self.stride)
                .build(),
        });
        Ok(())
    }
}

impl DataUbo<Static> {
    /// Creates the block and applies any initial payloads.
    pub fn create(rate: Rate, values: Vec<Trait>, min_alignment: u64) -> Result<Self> {
        let mut ubo = Self::new(rate, values);
        ubo.calculate_sizes(min_alignment)?;
        let initial = ubo
            .uniforms
            .iter()
            .filter(|u| u.value.payload().is_some())
            .map(|u| u.value.clone())
            .collect::<Vec<_>>();
        for value in &initial {
            ubo.set(value);
        }
        Ok(ubo)
    }
}

impl DataUbo<Dynamic> {
    pub fn create(rate: Rate, values: Vec<Trait>, min_alignment: u64) -> Result<Self> {
        let mut ubo = Self::new(rate, values);
        ubo.calculate_sizes(min_alignment)?;
        Ok(ubo)
    }

    /// Commits the current block and starts a new one holding the same values.
    pub fn push(&mut self) {
        self.used_count += 1;
        if !self.is_populated() {
            return;
        }

        let stride = self.stride as usize;
        let end = (self.used_count as usize + 1) * stride;
        if self.ram.len() < end {
            let grown = end.max(self.ram.len() * 2);
            self.ram.resize(grown, 0);
        }
        let previous = (self.used_count as usize - 1) * stride;
        self.ram
            .copy_within(previous..previous + stride, previous + stride);
    }

    pub fn reset(&mut self) {
        self.used_count = 0;
    }

    pub fn used_count(&self) -> u64 {
        self.used_count
    }

    /// Blocks the RAM arena can hold without growing.
    pub fn allocated(&self) -> u64 {
        if self.stride == 0 {
            0
        } else {
            self.ram.len() as u64 / self.stride
        }
    }

    /// Dynamic offset of the block currently being filled.
    ///
    /// Unpopulated blocks have no storage and report the raw block index so
    /// that consecutive pushes still yield distinct offsets.
    pub fn current_offset(&self) -> u32 {
        if self.is_populated() {
            (self.used_count * self.stride) as u32
        } else {
            self.used_count as u32
        }
    }
}

/// Combined image samplers of one renderable, bound from set 2.
pub struct SamplerUbo {
    textures: Vec<Option<Arc<TextureContent>>>,
    set: vk::DescriptorSet,
    written: bool,
}

impl SamplerUbo {
    pub fn new(textures: Vec<Option<Arc<TextureContent>>>) -> Self {
        Self {
            textures,
            set: vk::DescriptorSet::null(),
            written: false,
        }
    }

    pub fn textures(&self) -> &[Option<Arc<TextureContent>>] {
        &self.textures
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.textures.iter().all(Option::is_none)
    }

    pub(crate) fn assign(&mut self, set: vk::DescriptorSet) {
        self.set = set;
        self.written = false;
    }

    pub(crate) fn take_set(&mut self) -> vk::DescriptorSet {
        self.written = false;
        std::mem::replace(&mut self.set, vk::DescriptorSet::null())
    }

    pub(crate) fn mark_written(&mut self) {
        self.written = true;
    }

    pub fn matches(&self, textures: &[Option<Arc<TextureContent>>]) -> bool {
        self.textures.len() == textures.len()
            && self.textures.iter().zip(textures).all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            })
    }
}

impl PartialEq for SamplerUbo {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.textures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Scalar, TraitTag};
    use glam::{Mat4, Vec2, Vec3, Vec4};

    fn random_type(rng: &mut fastrand::Rng) -> DataType {
        let scalar = if rng.bool() { Scalar::F32 } else { Scalar::F64 };
        match rng.u8(0..6) {
            0 => DataType::vector(scalar, 1),
            1 => DataType::vector(scalar, 2),
            2 => DataType::vector(scalar, 3),
            3 => DataType::vector(scalar, 4),
            4 => DataType::matrix(Scalar::F32, rng.u8(2..5), rng.u8(2..5)),
            _ => DataType::Struct(vec![DataType::vector(scalar, 1), DataType::vector(scalar, 3)]),
        }
    }

    #[test]
    fn packing_obeys_alignment_laws() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..500 {
            let count = rng.usize(1..8);
            let values = (0..count)
                .map(|i| Trait::declare_as(TraitTag::ALL[i], random_type(&mut rng)))
                .collect::<Vec<_>>();
            let min_alignment = [16, 64, 256][rng.usize(0..3)];

            let ubo = DynamicUbo::create(Rate::PerInstance, values, min_alignment).unwrap();
            let uniforms = ubo.uniforms();

            for u in uniforms {
                assert_eq!(u.offset % u.value.data_type().base_alignment(), 0);
            }
            for pair in uniforms.windows(2) {
                assert!(pair[1].offset >= pair[0].offset + pair[0].size());
            }
            let last = uniforms.last().unwrap();
            assert_eq!(ubo.stride() % min_alignment, 0);
            assert!(ubo.stride() >= last.offset + last.size());
        }
    }

    #[test]
    fn three_vectors_align_to_four_scalars() {
        let ubo = StaticUbo::create(
            Rate::PerTick,
            vec![
                Trait::float(TraitTag::Time, 0.0),
                Trait::vec3(TraitTag::Place, Vec3::ZERO),
                Trait::float(TraitTag::Fov, 0.0),
                Trait::vec2(TraitTag::MousePosition, Vec2::ZERO),
            ],
            256,
        )
        .unwrap();

        let offsets = ubo.uniforms().iter().map(|u| u.offset).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 16, 28, 32]);
        assert_eq!(ubo.stride(), 256);
    }

    #[test]
    fn abstract_uniforms_are_rejected() {
        let result = StaticUbo::create(Rate::PerTick, vec![Trait::declare(TraitTag::Texture)], 16);
        assert!(matches!(
            result,
            Err(Error::AbstractUniform(TraitTag::Texture))
        ));
    }

    #[test]
    fn static_blocks_apply_initial_payloads() {
        let ubo = StaticUbo::create(
            Rate::PerTick,
            vec![
                Trait::declare(TraitTag::MousePosition),
                Trait::float(TraitTag::Time, 2.5),
            ],
            16,
        )
        .unwrap();
        let time = ubo.read(0, TraitTag::Time).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<f32>(time), 2.5);
    }

    #[test]
    fn dynamic_push_commits_and_carries_values_forward() {
        let mut ubo = DynamicUbo::create(
            Rate::PerInstance,
            vec![Trait::declare(TraitTag::Transformation)],
            64,
        )
        .unwrap();
        assert_eq!(ubo.stride(), 64);

        let a = Mat4::from_translation(Vec3::X);
        let b = Mat4::from_translation(Vec3::Y);

        assert!(ubo.set(&Trait::mat4(TraitTag::Transformation, a)));
        assert_eq!(ubo.current_offset(), 0);
        ubo.push();
        assert_eq!(ubo.current_offset(), 64);
        ubo.push();
        ubo.set(&Trait::mat4(TraitTag::Transformation, b));
        ubo.push();

        assert_eq!(ubo.used_count(), 3);
        assert!(ubo.allocated() >= 4);
        let read = |block| {
            bytemuck::pod_read_unaligned::<[f32; 16]>(ubo.read(block, TraitTag::Transformation).unwrap())
        };
        assert_eq!(read(0), a.to_cols_array());
        assert_eq!(read(1), a.to_cols_array());
        assert_eq!(read(2), b.to_cols_array());

        ubo.reset();
        assert_eq!(ubo.used_count(), 0);
        assert_eq!(ubo.current_offset(), 0);
    }

    #[test]
    fn unpopulated_blocks_report_raw_indices() {
        let mut ubo = DynamicUbo::create(Rate::PerLevel, vec![], 256).unwrap();
        assert!(!ubo.is_populated());
        assert_eq!(ubo.stride(), 0);
        ubo.push();
        ubo.push();
        assert_eq!(ubo.current_offset(), 2);
        assert!(!ubo.set(&Trait::vec4(TraitTag::Color, Vec4::ONE)));
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let mut ubo =
            DynamicUbo::create(Rate::PerRenderable, vec![Trait::declare(TraitTag::Color)], 16).unwrap();
        assert!(!ubo.set(&Trait::float(TraitTag::Time, 1.0)));
        assert!(ubo.set(&Trait::vec4(TraitTag::Color, Vec4::ONE)));
    }
}
