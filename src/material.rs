//! Minimal material generator: symbolic terms in, GLSL and a uniform catalog out.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write;
use std::hash::{Hash, Hasher};

use vulkanalia::vk;

use crate::asset::{Mesh, TextureMapping, Topology};
use crate::error::{Error, Result};
use crate::rate::Rate;
use crate::shader::{contains_token, ShaderStage};
use crate::traits::{DataType, Scalar, Trait, TraitTag};
use crate::ubo::pack;

/// GLSL name of the `index`-th combined image sampler.
pub fn sampler_name(index: usize) -> String {
    match index {
        0 => TraitTag::Texture.symbol().to_string(),
        i => format!("{}{}", TraitTag::Texture.symbol(), i),
    }
}

#[derive(Clone, Debug)]
pub enum Term {
    /// Feeds a stage input, e.g. a vertex attribute.
    Create { rate: Rate, input: Trait },
    /// Transforms `target` by the product of `by`, left to right.
    Project {
        rate: Rate,
        target: TraitTag,
        by: Vec<TraitTag>,
    },
    /// Modulates the output color by a texture or a color.
    Texturize { rate: Rate, with: Trait },
    /// Declares a color output for a render-pass attachment.
    Output { rate: Rate, format: vk::Format },
}

/// Source of one stage and the inputs it consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct StageSource {
    pub stage: ShaderStage,
    pub source: String,
    pub inputs: Vec<Trait>,
}

#[derive(Clone, Debug)]
pub struct Material {
    stages: Vec<StageSource>,
    catalog: Vec<(Rate, Trait)>,
    topology: Topology,
    hash: u64,
}

impl Material {
    fn new(stages: Vec<StageSource>, mut catalog: Vec<(Rate, Trait)>, topology: Topology) -> Self {
        catalog.sort_by_key(|(rate, value)| (*rate, value.tag()));

        let mut hasher = DefaultHasher::new();
        for stage in &stages {
            stage.stage.hash(&mut hasher);
            stage.source.hash(&mut hasher);
        }
        topology.hash(&mut hasher);

        Self {
            stages,
            catalog,
            topology,
            hash: hasher.finish(),
        }
    }

    /// A material from hand-written stages. Uniforms are discovered by
    /// scanning the sources for trait symbols.
    pub fn from_code(
        stages: Vec<(ShaderStage, String)>,
        vertex_inputs: Vec<Trait>,
        topology: Topology,
    ) -> Self {
        let mut catalog = Vec::new();
        for tag in TraitTag::ALL {
            let Some(rate) = tag.uniform_rate() else {
                continue;
            };
            if stages.iter().any(|(_, s)| contains_token(s, tag.symbol())) {
                catalog.push((rate, Trait::declare(tag)));
            }
        }

        let stages = stages
            .into_iter()
            .map(|(stage, source)| StageSource {
                stage,
                inputs: if stage == ShaderStage::Vertex {
                    vertex_inputs.clone()
                } else {
                    Vec::new()
                },
                source,
            })
            .collect();

        Self::new(stages, catalog, topology)
    }

    pub fn stages(&self) -> &[StageSource] {
        &self.stages
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&StageSource> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn catalog(&self) -> &[(Rate, Trait)] {
        &self.catalog
    }

    /// Catalog entries fed through UBOs at `rate`.
    pub fn uniforms_at(&self, rate: Rate) -> Vec<Trait> {
        self.catalog
            .iter()
            .filter(|(r, t)| *r == rate && t.tag() != TraitTag::Texture)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn texture_count(&self) -> usize {
        self.catalog
            .iter()
            .filter(|(_, t)| t.tag() == TraitTag::Texture)
            .count()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for Material {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.stages == other.stages
    }
}

/// Collects terms and turns them into a [`Material`].
#[derive(Clone, Debug)]
pub struct MaterialBuilder {
    terms: Vec<Term>,
    topology: Topology,
    mapping: TextureMapping,
}

impl MaterialBuilder {
    pub fn new(topology: Topology) -> Self {
        Self {
            terms: Vec::new(),
            topology,
            mapping: TextureMapping::Custom,
        }
    }

    /// Terms for every attribute of `mesh`.
    pub fn from_mesh(mesh: &Mesh) -> Result<Self> {
        let mut builder = Self::new(mesh.topology());
        builder.mapping = mesh.mapping();

        for attribute in mesh.attributes() {
            let input = Trait::declare_as(attribute.tag, attribute.ty.clone());
            match attribute.tag {
                TraitTag::Place => {
                    builder.create(Rate::PerVertex, input).project(
                        Rate::PerVertex,
                        TraitTag::Place,
                        vec![TraitTag::ViewProjectTransform, TraitTag::Transformation],
                    );
                }
                TraitTag::Aim => {
                    builder.create(Rate::PerVertex, input).project(
                        Rate::PerVertex,
                        TraitTag::Aim,
                        vec![TraitTag::Transformation],
                    );
                }
                TraitTag::Sampler => {
                    builder.create(Rate::PerVertex, input);
                    match mesh.mapping() {
                        TextureMapping::Custom => {}
                        TextureMapping::World => {
                            builder.project(
                                Rate::PerVertex,
                                TraitTag::Sampler,
                                vec![TraitTag::Transformation],
                            );
                        }
                        TextureMapping::Screen => {
                            builder.project(
                                Rate::PerVertex,
                                TraitTag::Sampler,
                                vec![TraitTag::ViewProjectTransform, TraitTag::Transformation],
                            );
                        }
                    }
                }
                TraitTag::Transformation => {
                    return Err(Error::Unimplemented("hardware instancing"));
                }
                TraitTag::Index => {}
                _ => {
                    builder.create(Rate::PerVertex, input);
                }
            }
        }
        Ok(builder)
    }

    pub fn create(&mut self, rate: Rate, input: Trait) -> &mut Self {
        self.terms.push(Term::Create { rate, input });
        self
    }

    pub fn project(&mut self, rate: Rate, target: TraitTag, by: Vec<TraitTag>) -> &mut Self {
        self.terms.push(Term::Project { rate, target, by });
        self
    }

    pub fn texturize(&mut self, rate: Rate, with: Trait) -> &mut Self {
        self.terms.push(Term::Texturize { rate, with });
        self
    }

    /// Declares the output of one attachment. Depth attachments need none.
    pub fn output(&mut self, format: vk::Format) -> Result<&mut Self> {
        match format {
            vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => {
                self.terms.push(Term::Output {
                    rate: Rate::PerPixel,
                    format,
                });
            }
            vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => {}
            _ => return Err(Error::Unimplemented("output attachment format")),
        }
        Ok(self)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn generate(&self) -> Result<Material> {
        let mut catalog: Vec<(Rate, Trait)> = Vec::new();
        let mut add_uniform = |catalog: &mut Vec<(Rate, Trait)>, tag: TraitTag| {
            if let Some(rate) = tag.uniform_rate()
                && !catalog.iter().any(|(_, t)| t.tag() == tag)
            {
                catalog.push((rate, Trait::declare(tag)));
            }
        };

        let mut inputs: Vec<Trait> = Vec::new();
        let mut projections: Vec<(TraitTag, &[TraitTag])> = Vec::new();
        let mut textures = 0usize;
        let mut tint = false;
        let mut outputs = 0usize;

        for term in &self.terms {
            match term {
                Term::Create { rate, input } => {
                    if *rate != Rate::PerVertex {
                        return Err(Error::Unimplemented("non-vertex stage input"));
                    }
                    if !inputs.iter().any(|i| i.tag() == input.tag()) {
                        inputs.push(input.clone());
                    }
                }
                Term::Project { target, by, .. } => {
                    for tag in by {
                        add_uniform(&mut catalog, *tag);
                    }
                    projections.push((*target, by));
                }
                Term::Texturize { with, .. } => match with.tag() {
                    TraitTag::Texture => {
                        catalog.push((Rate::PerRenderable, Trait::declare(TraitTag::Texture)));
                        textures += 1;
                    }
                    TraitTag::Color => {
                        add_uniform(&mut catalog, TraitTag::Color);
                        tint = true;
                    }
                    _ => return Err(Error::Unimplemented("texturize operand")),
                },
                Term::Output { .. } => outputs += 1,
            }
        }

        let blocks = UniformBlocks::new(&catalog)?;

        // Varyings: every vertex input except the position.
        let varyings = inputs
            .iter()
            .filter(|i| i.tag() != TraitTag::Place)
            .cloned()
            .collect::<Vec<_>>();
        let fullscreen = inputs.is_empty();

        let vertex = self.vertex_source(&inputs, &varyings, &projections, fullscreen, textures > 0, &blocks)?;
        let pixel = self.pixel_source(&varyings, fullscreen, textures, tint, outputs.max(1), &blocks)?;

        let stages = vec![
            StageSource {
                stage: ShaderStage::Vertex,
                source: vertex,
                inputs,
            },
            StageSource {
                stage: ShaderStage::Pixel,
                source: pixel,
                inputs: varyings,
            },
        ];
        Ok(Material::new(stages, catalog, self.topology))
    }

    fn vertex_source(
        &self,
        inputs: &[Trait],
        varyings: &[Trait],
        projections: &[(TraitTag, &[TraitTag])],
        fullscreen: bool,
        textured: bool,
        blocks: &UniformBlocks,
    ) -> Result<String> {
        let mut body = String::new();

        if fullscreen {
            // (-1,-1), (-1,3), (3,-1): counter-clockwise with Y down.
            body.push_str("    vec2 uv = vec2(gl_VertexIndex & 2, (gl_VertexIndex << 1) & 2);\n");
            body.push_str("    gl_Position = vec4(uv * 2.0 - 1.0, 0.0, 1.0);\n");
            if textured {
                body.push_str("    vSampler = uv;\n");
            }
        }

        for varying in varyings {
            let sym = varying.tag().symbol();
            let _ = writeln!(body, "    v{sym} = in{sym};");
        }

        let place = inputs.iter().find(|i| i.tag() == TraitTag::Place);
        if let Some(place) = place {
            let position = homogeneous("inPlace", place.data_type())?;
            let by = projections
                .iter()
                .find(|(target, _)| *target == TraitTag::Place)
                .map(|(_, by)| product(by));
            match by {
                Some(by) => {
                    let _ = writeln!(body, "    gl_Position = {by} * {position};");
                }
                None => {
                    let _ = writeln!(body, "    gl_Position = {position};");
                }
            }
        }

        for (target, by) in projections {
            match target {
                TraitTag::Place => {}
                TraitTag::Aim => {
                    let _ = writeln!(body, "    vAim = mat3({}) * inAim;", product(by));
                }
                TraitTag::Sampler => {
                    let Some(place) = place else {
                        continue;
                    };
                    let position = homogeneous("inPlace", place.data_type())?;
                    let _ = writeln!(body, "    vec4 mapped = {} * {position};", product(by));
                    if by.contains(&TraitTag::ViewProjectTransform) {
                        body.push_str("    vSampler = mapped.xy / mapped.w * 0.5 + 0.5;\n");
                    } else {
                        body.push_str("    vSampler = mapped.xy;\n");
                    }
                }
                _ => return Err(Error::Unimplemented("projection target")),
            }
        }

        let mut source = String::from("#version 450\n\n");
        blocks.declare(&mut source, &body);

        for (location, input) in inputs.iter().enumerate() {
            let ty = glsl_type(input)?;
            let _ = writeln!(
                source,
                "layout(location = {location}) in {ty} in{};",
                input.tag().symbol()
            );
        }
        let mut location = 0;
        for varying in varyings {
            let _ = writeln!(
                source,
                "layout(location = {location}) {}out {} v{};",
                interpolation(varying),
                glsl_type(varying)?,
                varying.tag().symbol()
            );
            location += 1;
        }
        if fullscreen && textured {
            let _ = writeln!(source, "layout(location = {location}) out vec2 vSampler;");
        }

        source.push_str("\nvoid main() {\n");
        source.push_str(&body);
        source.push_str("}\n");
        Ok(source)
    }

    fn pixel_source(
        &self,
        varyings: &[Trait],
        fullscreen: bool,
        textures: usize,
        tint: bool,
        outputs: usize,
        blocks: &UniformBlocks,
    ) -> Result<String> {
        let has_sampler = fullscreen || varyings.iter().any(|v| v.tag() == TraitTag::Sampler);
        let mut body = String::from("    vec4 color = vec4(1.0);\n");

        if let Some(color) = varyings.iter().find(|v| v.tag() == TraitTag::Color) {
            let _ = writeln!(body, "    color *= {};", homogeneous("vColor", color.data_type())?);
        }
        for i in 0..textures {
            let coordinate = if has_sampler { "vSampler" } else { "vec2(0.5)" };
            let _ = writeln!(body, "    color *= texture({}, {coordinate});", sampler_name(i));
        }
        if tint {
            body.push_str("    color *= Color;\n");
        }
        for i in 0..outputs {
            let _ = writeln!(body, "    outColor{i} = color;");
        }

        let mut source = String::from("#version 450\n\n");
        blocks.declare(&mut source, &body);
        for i in 0..textures {
            let _ = writeln!(
                source,
                "layout(set = 2, binding = {i}) uniform sampler2D {};",
                sampler_name(i)
            );
        }

        let mut location = 0;
        for varying in varyings {
            let _ = writeln!(
                source,
                "layout(location = {location}) {}in {} v{};",
                interpolation(varying),
                glsl_type(varying)?,
                varying.tag().symbol()
            );
            location += 1;
        }
        if fullscreen && textures > 0 {
            let _ = writeln!(source, "layout(location = {location}) in vec2 vSampler;");
        }
        for i in 0..outputs {
            let _ = writeln!(source, "layout(location = {i}) out vec4 outColor{i};");
        }

        source.push_str("\nvoid main() {\n");
        source.push_str(&body);
        source.push_str("}\n");
        Ok(source)
    }
}

fn glsl_type(value: &Trait) -> Result<String> {
    value
        .data_type()
        .glsl()
        .ok_or(Error::UnsupportedAttribute(value.tag()))
}

fn interpolation(value: &Trait) -> &'static str {
    match value.data_type().vector_shape() {
        Some((Scalar::I32 | Scalar::U32 | Scalar::F64, _)) => "flat ",
        _ => "",
    }
}

fn product(by: &[TraitTag]) -> String {
    by.iter().map(|t| t.symbol()).collect::<Vec<_>>().join(" * ")
}

/// `name` widened to a `vec4` with `w = 1`.
fn homogeneous(name: &str, ty: &DataType) -> Result<String> {
    match ty.vector_shape() {
        Some((Scalar::F32, 1)) => Ok(format!("vec4({name}, 0.0, 0.0, 1.0)")),
        Some((Scalar::F32, 2)) => Ok(format!("vec4({name}, 0.0, 1.0)")),
        Some((Scalar::F32, 3)) => Ok(format!("vec4({name}, 1.0)")),
        Some((Scalar::F32, 4)) => Ok(name.to_string()),
        _ => Err(Error::Unimplemented("non-float position")),
    }
}

/// std140 block declarations for every UBO-backed rate of a catalog.
struct UniformBlocks {
    blocks: Vec<(u32, u32, Rate, Vec<(u64, Trait)>)>,
}

impl UniformBlocks {
    fn new(catalog: &[(Rate, Trait)]) -> Result<Self> {
        let mut blocks = Vec::new();
        for (set, rates) in [(0u32, &Rate::STATIC[..]), (1, &Rate::DYNAMIC[..])] {
            let mut binding = 0;
            for rate in rates {
                let mut members = catalog
                    .iter()
                    .filter(|(r, t)| r == rate && t.tag() != TraitTag::Texture)
                    .map(|(_, t)| t.clone())
                    .collect::<Vec<_>>();
                if members.is_empty() {
                    continue;
                }
                members.sort_by_key(Trait::tag);

                let types = members.iter().map(Trait::data_type).collect::<Vec<_>>();
                let (offsets, _) = pack(&types).ok_or(Error::AbstractUniform(members[0].tag()))?;
                blocks.push((set, binding, *rate, offsets.into_iter().zip(members).collect()));
                binding += 1;
            }
        }
        Ok(Self { blocks })
    }

    /// Declares the blocks with at least one member referenced from `body`.
    fn declare(&self, source: &mut String, body: &str) {
        for (set, binding, rate, members) in &self.blocks {
            if !members
                .iter()
                .any(|(_, t)| contains_token(body, t.tag().symbol()))
            {
                continue;
            }
            let _ = writeln!(
                source,
                "layout(std140, set = {set}, binding = {binding}) uniform {} {{",
                rate.block_name()
            );
            for (offset, member) in members {
                let ty = member.data_type().glsl().unwrap_or_else(|| "float".to_string());
                let _ = writeln!(
                    source,
                    "    layout(offset = {offset}) {ty} {};",
                    member.tag().symbol()
                );
            }
            source.push_str("};\n\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Texture;
    use std::sync::Arc;

    fn textured_triangle() -> Mesh {
        Mesh::new(Topology::Triangles)
            .with_places(&[[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]])
            .with_samplers(&[[0.0, 0.0], [1.0, 0.0], [0.5, 1.0]])
    }

    #[test]
    fn mesh_places_are_projected() {
        let mut builder = MaterialBuilder::from_mesh(&textured_triangle()).unwrap();
        builder.texturize(Rate::PerPixel, Trait::texture(Arc::new(Texture::solid([255, 0, 0, 255]))));
        builder.output(vk::Format::B8G8R8A8_UNORM).unwrap();
        let material = builder.generate().unwrap();

        let vertex = &material.stage(ShaderStage::Vertex).unwrap().source;
        assert!(vertex.contains("gl_Position = ViewProjectTransform * Transformation * vec4(inPlace, 1.0);"));
        assert!(vertex.contains("layout(location = 1) in vec2 inSampler;"));
        assert!(vertex.contains("layout(std140, set = 1, binding = 0) uniform PerLevelBlock"));
        assert!(vertex.contains("layout(std140, set = 1, binding = 1) uniform PerInstanceBlock"));

        let pixel = &material.stage(ShaderStage::Pixel).unwrap().source;
        assert!(pixel.contains("layout(set = 2, binding = 0) uniform sampler2D Texture;"));
        assert!(pixel.contains("texture(Texture, vSampler)"));
        assert!(!pixel.contains("PerInstanceBlock"));

        assert_eq!(material.texture_count(), 1);
        assert_eq!(material.uniforms_at(Rate::PerInstance).len(), 1);
        assert_eq!(material.uniforms_at(Rate::PerLevel).len(), 1);
    }

    #[test]
    fn catalog_is_ordered_by_rate() {
        let mut builder = MaterialBuilder::from_mesh(&textured_triangle()).unwrap();
        builder.texturize(Rate::PerPixel, Trait::vec4(TraitTag::Color, glam::Vec4::ONE));
        let material = builder.generate().unwrap();
        let rates = material.catalog().iter().map(|(r, _)| *r).collect::<Vec<_>>();
        let mut sorted = rates.clone();
        sorted.sort();
        assert_eq!(rates, sorted);
        assert!(material.catalog().iter().all(|(_, t)| t.payload().is_none()));
    }

    #[test]
    fn no_vertex_input_means_fullscreen_triangle() {
        let mut builder = MaterialBuilder::new(Topology::Triangles);
        builder.texturize(Rate::PerPixel, Trait::texture(Arc::new(Texture::solid([0; 4]))));
        let material = builder.generate().unwrap();
        let vertex = &material.stage(ShaderStage::Vertex).unwrap().source;
        assert!(vertex.contains("vec2(gl_VertexIndex & 2, (gl_VertexIndex << 1) & 2)"));
        assert!(material.stage(ShaderStage::Vertex).unwrap().inputs.is_empty());
    }

    #[test]
    fn instancing_attributes_are_unimplemented() {
        let mesh = Mesh::new(Topology::Triangles).with_attribute(
            TraitTag::Transformation,
            DataType::matrix(Scalar::F32, 4, 4),
            &[[0.0f32; 16]],
        );
        assert!(matches!(
            MaterialBuilder::from_mesh(&mesh),
            Err(Error::Unimplemented(_))
        ));
    }

    #[test]
    fn outputs_depend_on_attachment_format() {
        let mut builder = MaterialBuilder::new(Topology::Triangles);
        assert!(builder.output(vk::Format::B8G8R8A8_UNORM).is_ok());
        assert!(builder.output(vk::Format::D32_SFLOAT).is_ok());
        assert_eq!(builder.terms().len(), 1);
        assert!(matches!(
            builder.output(vk::Format::R16G16B16A16_SFLOAT),
            Err(Error::Unimplemented(_))
        ));
    }

    #[test]
    fn code_materials_scan_for_uniforms() {
        let material = Material::from_code(
            vec![(
                ShaderStage::Pixel,
                "void main() { out0 = vec4(Time) * texture(Texture, vec2(0.0)); }".to_string(),
            )],
            Vec::new(),
            Topology::Triangles,
        );
        assert_eq!(material.uniforms_at(Rate::PerTick).len(), 1);
        assert_eq!(material.texture_count(), 1);
    }

    #[test]
    fn equal_terms_generate_equal_materials() {
        let a = MaterialBuilder::from_mesh(&textured_triangle()).unwrap().generate().unwrap();
        let b = MaterialBuilder::from_mesh(&textured_triangle()).unwrap().generate().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }
}
