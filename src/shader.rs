use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::sync::Arc;

use vulkanalia::prelude::v1_3::*;

use crate::error::{Error, Result};
use crate::traits::{DataType, Scalar, Trait};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Geometry,
    TessCtrl,
    TessEval,
    Pixel,
    Compute,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 6] = [
        ShaderStage::Vertex,
        ShaderStage::Geometry,
        ShaderStage::TessCtrl,
        ShaderStage::TessEval,
        ShaderStage::Pixel,
        ShaderStage::Compute,
    ];

    pub fn vk_flag(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::TessCtrl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessEval => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn shader_kind(self) -> shaderc::ShaderKind {
        match self {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Geometry => shaderc::ShaderKind::Geometry,
            ShaderStage::TessCtrl => shaderc::ShaderKind::TessControl,
            ShaderStage::TessEval => shaderc::ShaderKind::TessEvaluation,
            ShaderStage::Pixel => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Geometry => "geom",
            ShaderStage::TessCtrl => "tesc",
            ShaderStage::TessEval => "tese",
            ShaderStage::Pixel => "frag",
            ShaderStage::Compute => "comp",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.extension().eq_ignore_ascii_case(extension))
    }
}

/// Vertex format of an attribute with the given layout.
pub fn vertex_format(ty: &DataType) -> Option<vk::Format> {
    let (scalar, components) = ty.vector_shape()?;
    let format = match (scalar, components) {
        (Scalar::F32, 1) => vk::Format::R32_SFLOAT,
        (Scalar::F32, 2) => vk::Format::R32G32_SFLOAT,
        (Scalar::F32, 3) => vk::Format::R32G32B32_SFLOAT,
        (Scalar::F32, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (Scalar::F64, 1) => vk::Format::R64_SFLOAT,
        (Scalar::F64, 2) => vk::Format::R64G64_SFLOAT,
        (Scalar::F64, 3) => vk::Format::R64G64B64_SFLOAT,
        (Scalar::F64, 4) => vk::Format::R64G64B64A64_SFLOAT,
        (Scalar::I32, 1) => vk::Format::R32_SINT,
        (Scalar::I32, 2) => vk::Format::R32G32_SINT,
        (Scalar::I32, 3) => vk::Format::R32G32B32_SINT,
        (Scalar::I32, 4) => vk::Format::R32G32B32A32_SINT,
        (Scalar::U32, 1) => vk::Format::R32_UINT,
        (Scalar::U32, 2) => vk::Format::R32G32_UINT,
        (Scalar::U32, 3) => vk::Format::R32G32B32_UINT,
        (Scalar::U32, 4) => vk::Format::R32G32B32A32_UINT,
        _ => return None,
    };
    Some(format)
}

/// Whether `token` occurs in `source` as a whole identifier.
pub fn contains_token(source: &str, token: &str) -> bool {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    source.match_indices(token).any(|(at, _)| {
        let before = source[..at].chars().next_back();
        let after = source[at + token.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

/// GLSL source with line numbers, for compile error reports.
pub fn pretty_source(source: &str) -> String {
    source
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:4} | {}\n", i + 1, line))
        .collect()
}

fn compiler() -> Result<shaderc::Compiler> {
    shaderc::Compiler::new()
        .map_err(|e| Error::ShaderCompile(format!("shaderc is unavailable: {e}")))
}

/// GLSL for one stage, its vertex inputs, and once compiled, its module.
pub struct Shader {
    stage: ShaderStage,
    source: String,
    inputs: Vec<Trait>,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    module: vk::ShaderModule,
    device: Option<Arc<Device>>,
    hash: u64,
}

impl Shader {
    pub fn new(stage: ShaderStage, source: impl Into<String>) -> Self {
        let source = source.into();
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        stage.hash(&mut hasher);

        Self {
            stage,
            source,
            inputs: Vec::new(),
            bindings: Vec::new(),
            attributes: Vec::new(),
            module: vk::ShaderModule::null(),
            device: None,
            hash: hasher.finish(),
        }
    }

    /// Declares a stage input. Vertex inputs also get one binding each.
    pub fn add_input(&mut self, input: &Trait) -> Result<()> {
        if self.stage != ShaderStage::Vertex {
            self.inputs.push(input.clone());
            return Ok(());
        }

        let ty = input.data_type();
        let format = vertex_format(ty).ok_or(Error::UnsupportedAttribute(input.tag()))?;
        let location = self.bindings.len() as u32;

        self.bindings.push(
            vk::VertexInputBindingDescription::builder()
                .binding(location)
                .stride(ty.stride() as u32)
                .input_rate(vk::VertexInputRate::VERTEX)
                .build(),
        );
        self.attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .binding(location)
                .location(location)
                .format(format)
                .offset(0)
                .build(),
        );
        self.inputs.push(input.clone());
        Ok(())
    }

    pub unsafe fn compile(&mut self, device: &Arc<Device>) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let compiler = compiler()?;

        let file_name = format!("generated.{}", self.stage.extension());
        let compiled = match compiler.compile_into_spirv(
            &self.source,
            self.stage.shader_kind(),
            &file_name,
            "main",
            None,
        ) {
            Ok(compiled) => compiled,
            Err(e) => {
                log::error!(
                    "Failed to compile {:?} shader:\n{}",
                    self.stage,
                    pretty_source(&self.source)
                );
                return Err(Error::ShaderCompile(e.to_string()));
            }
        };

        let code = compiled.as_binary();
        let info = vk::ShaderModuleCreateInfo::builder()
            .code_size(code.len() * size_of::<u32>())
            .code(code);

        self.module = device.create_shader_module(&info, None)?;
        self.device = Some(device.clone());
        Ok(())
    }

    /// Destroys the module. The stage can be compiled again afterwards.
    pub fn release(&mut self) {
        if let Some(device) = self.device.take() {
            unsafe { device.destroy_shader_module(self.module, None) };
            self.module = vk::ShaderModule::null();
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.device.is_some()
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage.vk_flag())
            .module(self.module)
            .name(b"main\0")
            .build()
    }

    pub fn uses(&self, token: &str) -> bool {
        contains_token(&self.source, token)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn inputs(&self) -> &[Trait] {
        &self.inputs
    }

    pub fn bindings(&self) -> &[vk::VertexInputBindingDescription] {
        &self.bindings
    }

    pub fn attributes(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.attributes
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for Shader {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.stage == other.stage && self.source == other.source
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("stage", &self.stage)
            .field("hash", &self.hash)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}
