//! Typed, named values: the only currency by which host data reaches the GPU.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytemuck::Pod;

use crate::asset::{Mesh, Texture};
use crate::rate::Rate;

/// Tag from the closed trait registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraitTag {
    Place,
    Aim,
    Sampler,
    Transformation,
    Index,
    Texture,
    Color,
    Code,
    Shader,
    Time,
    MousePosition,
    MouseScroll,
    ViewTransform,
    ViewProjectTransform,
    ProjectTransform,
    InvertedProjectTransform,
    Fov,
    Resolution,
    Level,
    Size,
    Geometry,
}

impl TraitTag {
    pub const ALL: [TraitTag; 21] = [
        TraitTag::Place,
        TraitTag::Aim,
        TraitTag::Sampler,
        TraitTag::Transformation,
        TraitTag::Index,
        TraitTag::Texture,
        TraitTag::Color,
        TraitTag::Code,
        TraitTag::Shader,
        TraitTag::Time,
        TraitTag::MousePosition,
        TraitTag::MouseScroll,
        TraitTag::ViewTransform,
        TraitTag::ViewProjectTransform,
        TraitTag::ProjectTransform,
        TraitTag::InvertedProjectTransform,
        TraitTag::Fov,
        TraitTag::Resolution,
        TraitTag::Level,
        TraitTag::Size,
        TraitTag::Geometry,
    ];

    /// Identifier the trait goes by inside generated GLSL.
    pub fn symbol(self) -> &'static str {
        match self {
            TraitTag::Place => "Place",
            TraitTag::Aim => "Aim",
            TraitTag::Sampler => "Sampler",
            TraitTag::Transformation => "Transformation",
            TraitTag::Index => "Index",
            TraitTag::Texture => "Texture",
            TraitTag::Color => "Color",
            TraitTag::Code => "Code",
            TraitTag::Shader => "Shader",
            TraitTag::Time => "Time",
            TraitTag::MousePosition => "MousePosition",
            TraitTag::MouseScroll => "MouseScroll",
            TraitTag::ViewTransform => "ViewTransform",
            TraitTag::ViewProjectTransform => "ViewProjectTransform",
            TraitTag::ProjectTransform => "ProjectTransform",
            TraitTag::InvertedProjectTransform => "InvertedProjectTransform",
            TraitTag::Fov => "FOV",
            TraitTag::Resolution => "Resolution",
            TraitTag::Level => "Level",
            TraitTag::Size => "Size",
            TraitTag::Geometry => "Geometry",
        }
    }

    /// Memory layout a value of this trait has unless stated otherwise.
    pub fn default_type(self) -> DataType {
        use Scalar::*;
        match self {
            TraitTag::Place | TraitTag::Aim | TraitTag::Size => DataType::vector(F32, 3),
            TraitTag::Sampler
            | TraitTag::MousePosition
            | TraitTag::MouseScroll
            | TraitTag::Resolution => DataType::vector(F32, 2),
            TraitTag::Color => DataType::vector(F32, 4),
            TraitTag::Transformation
            | TraitTag::ViewTransform
            | TraitTag::ViewProjectTransform
            | TraitTag::ProjectTransform
            | TraitTag::InvertedProjectTransform => DataType::matrix(F32, 4, 4),
            TraitTag::Time | TraitTag::Fov => DataType::vector(F32, 1),
            TraitTag::Index => DataType::vector(U32, 1),
            TraitTag::Level => DataType::vector(I32, 1),
            TraitTag::Texture | TraitTag::Code | TraitTag::Shader | TraitTag::Geometry => {
                DataType::Abstract
            }
        }
    }

    /// Rate at which the trait is fed as a uniform, if it ever is.
    pub fn uniform_rate(self) -> Option<Rate> {
        match self {
            TraitTag::Time | TraitTag::MousePosition | TraitTag::MouseScroll => Some(Rate::PerTick),
            TraitTag::ProjectTransform
            | TraitTag::InvertedProjectTransform
            | TraitTag::Fov
            | TraitTag::Resolution => Some(Rate::PerCamera),
            TraitTag::ViewTransform | TraitTag::ViewProjectTransform | TraitTag::Level => {
                Some(Rate::PerLevel)
            }
            TraitTag::Texture | TraitTag::Color => Some(Rate::PerRenderable),
            TraitTag::Transformation => Some(Rate::PerInstance),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    F32,
    F64,
    I32,
    U32,
}

impl Scalar {
    pub fn size(self) -> u64 {
        match self {
            Scalar::F64 => 8,
            _ => 4,
        }
    }

    fn glsl_prefix(self) -> &'static str {
        match self {
            Scalar::F32 => "",
            Scalar::F64 => "d",
            Scalar::I32 => "i",
            Scalar::U32 => "u",
        }
    }

    fn glsl_name(self) -> &'static str {
        match self {
            Scalar::F32 => "float",
            Scalar::F64 => "double",
            Scalar::I32 => "int",
            Scalar::U32 => "uint",
        }
    }
}

/// Memory layout of a trait payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// One to four components; one component is a plain scalar.
    Vector { scalar: Scalar, components: u8 },
    /// Column-major matrix.
    Matrix { scalar: Scalar, columns: u8, rows: u8 },
    Struct(Vec<DataType>),
    /// No concrete layout, e.g. an opaque texture handle.
    Abstract,
}

/// Rounds `value` up to a multiple of `alignment`; 0 and 1 leave it as is.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

impl DataType {
    pub const fn vector(scalar: Scalar, components: u8) -> Self {
        DataType::Vector { scalar, components }
    }

    pub const fn matrix(scalar: Scalar, columns: u8, rows: u8) -> Self {
        DataType::Matrix {
            scalar,
            columns,
            rows,
        }
    }

    pub fn is_abstract(&self) -> bool {
        match self {
            DataType::Abstract => true,
            DataType::Struct(members) => members.is_empty() || members.iter().any(|m| m.is_abstract()),
            _ => false,
        }
    }

    /// Component count and scalar for vectors, `None` for everything else.
    pub fn vector_shape(&self) -> Option<(Scalar, u8)> {
        match self {
            DataType::Vector { scalar, components } => Some((*scalar, *components)),
            _ => None,
        }
    }

    /// Bytes between consecutive values of this type.
    pub fn stride(&self) -> u64 {
        match self {
            DataType::Vector { scalar, components } => scalar.size() * u64::from(*components),
            DataType::Matrix { scalar, columns, rows } => {
                let column = DataType::vector(*scalar, *rows);
                align_up(column.stride(), column.base_alignment()) * u64::from(*columns)
            }
            DataType::Struct(members) => {
                let mut cursor = 0;
                for member in members {
                    cursor = align_up(cursor, member.base_alignment()) + member.stride();
                }
                align_up(cursor, self.base_alignment())
            }
            DataType::Abstract => 0,
        }
    }

    /// Base alignment under the std140/std430 rules.
    pub fn base_alignment(&self) -> u64 {
        match self {
            DataType::Vector { scalar, components: 3 } => 4 * scalar.size(),
            DataType::Vector { .. } => self.stride(),
            DataType::Matrix { scalar, rows, .. } => DataType::vector(*scalar, *rows).base_alignment(),
            DataType::Struct(members) => members
                .iter()
                .map(DataType::base_alignment)
                .max()
                .unwrap_or(1),
            DataType::Abstract => 1,
        }
    }

    /// GLSL spelling of the type, `None` for structs and abstract types.
    pub fn glsl(&self) -> Option<String> {
        match self {
            DataType::Vector { scalar, components: 1 } => Some(scalar.glsl_name().to_string()),
            DataType::Vector { scalar, components } => {
                Some(format!("{}vec{}", scalar.glsl_prefix(), components))
            }
            DataType::Matrix {
                scalar: scalar @ (Scalar::F32 | Scalar::F64),
                columns,
                rows,
            } if columns == rows => Some(format!("{}mat{}", scalar.glsl_prefix(), columns)),
            DataType::Matrix {
                scalar: scalar @ (Scalar::F32 | Scalar::F64),
                columns,
                rows,
            } => Some(format!("{}mat{}x{}", scalar.glsl_prefix(), columns, rows)),
            _ => None,
        }
    }
}

/// Payload of a trait.
#[derive(Clone, Debug)]
pub enum TraitData {
    /// Nothing attached and no layout known.
    Empty,
    /// Layout known, value not (yet) provided.
    Declared(DataType),
    Bytes { ty: DataType, bytes: Vec<u8> },
    Texture(Arc<Texture>),
    Mesh(Arc<Mesh>),
}

#[derive(Clone, Debug)]
pub struct Trait {
    tag: TraitTag,
    data: TraitData,
}

impl Trait {
    pub fn new<T: Pod>(tag: TraitTag, ty: DataType, value: &T) -> Self {
        Self {
            tag,
            data: TraitData::Bytes {
                ty,
                bytes: bytemuck::bytes_of(value).to_vec(),
            },
        }
    }

    /// A trait carrying its tag's default layout but no value.
    pub fn declare(tag: TraitTag) -> Self {
        let data = match tag.default_type() {
            DataType::Abstract => TraitData::Empty,
            ty => TraitData::Declared(ty),
        };
        Self { tag, data }
    }

    pub fn declare_as(tag: TraitTag, ty: DataType) -> Self {
        Self {
            tag,
            data: TraitData::Declared(ty),
        }
    }

    pub fn float(tag: TraitTag, value: f32) -> Self {
        Self::new(tag, DataType::vector(Scalar::F32, 1), &value)
    }

    pub fn int(tag: TraitTag, value: i32) -> Self {
        Self::new(tag, DataType::vector(Scalar::I32, 1), &value)
    }

    pub fn vec2(tag: TraitTag, value: glam::Vec2) -> Self {
        Self::new(tag, DataType::vector(Scalar::F32, 2), &value.to_array())
    }

    pub fn vec3(tag: TraitTag, value: glam::Vec3) -> Self {
        Self::new(tag, DataType::vector(Scalar::F32, 3), &value.to_array())
    }

    pub fn vec4(tag: TraitTag, value: glam::Vec4) -> Self {
        Self::new(tag, DataType::vector(Scalar::F32, 4), &value.to_array())
    }

    pub fn mat4(tag: TraitTag, value: glam::Mat4) -> Self {
        Self::new(tag, DataType::matrix(Scalar::F32, 4, 4), &value.to_cols_array())
    }

    pub fn texture(texture: Arc<Texture>) -> Self {
        Self {
            tag: TraitTag::Texture,
            data: TraitData::Texture(texture),
        }
    }

    pub fn mesh(mesh: Arc<Mesh>) -> Self {
        Self {
            tag: TraitTag::Geometry,
            data: TraitData::Mesh(mesh),
        }
    }

    pub fn tag(&self) -> TraitTag {
        self.tag
    }

    pub fn data(&self) -> &TraitData {
        &self.data
    }

    /// Concrete layout of the payload, or `Abstract`.
    pub fn data_type(&self) -> &DataType {
        match &self.data {
            TraitData::Declared(ty) | TraitData::Bytes { ty, .. } => ty,
            _ => &DataType::Abstract,
        }
    }

    /// Raw bytes, when a value is attached.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.data {
            TraitData::Bytes { bytes, .. } => Some(bytes),
            _ => None,
        }
    }
}

impl PartialEq for Trait {
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match (&self.data, &other.data) {
            (TraitData::Empty, TraitData::Empty) => true,
            (TraitData::Declared(a), TraitData::Declared(b)) => a == b,
            (TraitData::Bytes { ty: ta, bytes: ba }, TraitData::Bytes { ty: tb, bytes: bb }) => {
                ta == tb && ba == bb
            }
            (TraitData::Texture(a), TraitData::Texture(b)) => {
                Arc::ptr_eq(a, b) || a.hash() == b.hash()
            }
            (TraitData::Mesh(a), TraitData::Mesh(b)) => Arc::ptr_eq(a, b) || a.hash() == b.hash(),
            _ => false,
        }
    }
}

impl Hash for Trait {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        match &self.data {
            TraitData::Empty => 0u8.hash(state),
            TraitData::Declared(ty) => ty.hash(state),
            TraitData::Bytes { ty, bytes } => {
                ty.hash(state);
                bytes.hash(state);
            }
            TraitData::Texture(texture) => texture.hash().hash(state),
            TraitData::Mesh(mesh) => mesh.hash().hash(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Scalar::*;

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(12, 16), 16);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn vectors_align_to_their_size_except_three_components() {
        assert_eq!(DataType::vector(F32, 1).base_alignment(), 4);
        assert_eq!(DataType::vector(F32, 2).base_alignment(), 8);
        assert_eq!(DataType::vector(F32, 3).base_alignment(), 16);
        assert_eq!(DataType::vector(F32, 3).stride(), 12);
        assert_eq!(DataType::vector(F32, 4).base_alignment(), 16);
        assert_eq!(DataType::vector(F64, 3).base_alignment(), 32);
    }

    #[test]
    fn matrices_are_arrays_of_aligned_columns() {
        let mat4 = DataType::matrix(F32, 4, 4);
        assert_eq!(mat4.stride(), 64);
        assert_eq!(mat4.base_alignment(), 16);
        let mat3 = DataType::matrix(F32, 3, 3);
        assert_eq!(mat3.stride(), 48);
        assert_eq!(mat3.glsl().as_deref(), Some("mat3"));
        assert_eq!(DataType::matrix(F32, 2, 3).glsl().as_deref(), Some("mat2x3"));
    }

    #[test]
    fn structs_take_the_largest_member_alignment() {
        let ty = DataType::Struct(vec![DataType::vector(F32, 1), DataType::vector(F32, 3)]);
        assert_eq!(ty.base_alignment(), 16);
        // float at 0, vec3 at 16, rounded up to 32
        assert_eq!(ty.stride(), 32);
        assert!(DataType::Struct(vec![]).is_abstract());
        assert!(DataType::Struct(vec![DataType::Abstract]).is_abstract());
    }

    #[test]
    fn traits_compare_by_tag_and_payload() {
        let a = Trait::float(TraitTag::Time, 1.0);
        let b = Trait::float(TraitTag::Time, 1.0);
        let c = Trait::float(TraitTag::Time, 2.0);
        let d = Trait::float(TraitTag::Fov, 1.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(Trait::declare(TraitTag::Color).data_type(), &DataType::vector(F32, 4));
        assert!(Trait::declare(TraitTag::Texture).data_type().is_abstract());
    }

    #[test]
    fn glsl_spellings() {
        assert_eq!(DataType::vector(F32, 1).glsl().as_deref(), Some("float"));
        assert_eq!(DataType::vector(I32, 3).glsl().as_deref(), Some("ivec3"));
        assert_eq!(DataType::vector(F64, 2).glsl().as_deref(), Some("dvec2"));
        assert_eq!(DataType::Abstract.glsl(), None);
    }
}
