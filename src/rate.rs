use crate::shader::ShaderStage;

pub const STATIC_RATE_COUNT: usize = 2;
pub const DYNAMIC_RATE_COUNT: usize = 4;

/// Update frequency of a uniform.
///
/// Static rates live in descriptor set 0, dynamic rates in set 1 (bound with
/// per-draw dynamic offsets). Samplers at renderable rate go to set 2. Stage
/// rates never map to a UBO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rate {
    PerTick,
    PerPass,
    PerCamera,
    PerLevel,
    PerRenderable,
    PerInstance,
    PerVertex,
    PerPrimitive,
    PerPixel,
}

impl Rate {
    pub const STATIC: [Rate; STATIC_RATE_COUNT] = [Rate::PerTick, Rate::PerPass];
    pub const DYNAMIC: [Rate; DYNAMIC_RATE_COUNT] = [
        Rate::PerCamera,
        Rate::PerLevel,
        Rate::PerRenderable,
        Rate::PerInstance,
    ];

    pub fn is_static(self) -> bool {
        self.static_index().is_some()
    }

    pub fn is_dynamic(self) -> bool {
        self.dynamic_index().is_some()
    }

    pub fn static_index(self) -> Option<usize> {
        Self::STATIC.iter().position(|r| *r == self)
    }

    pub fn dynamic_index(self) -> Option<usize> {
        Self::DYNAMIC.iter().position(|r| *r == self)
    }

    /// Shader stage a stage rate belongs to.
    pub fn stage(self) -> Option<ShaderStage> {
        match self {
            Rate::PerVertex => Some(ShaderStage::Vertex),
            Rate::PerPrimitive => Some(ShaderStage::Geometry),
            Rate::PerPixel => Some(ShaderStage::Pixel),
            _ => None,
        }
    }

    /// Name used for generated uniform blocks.
    pub fn block_name(self) -> &'static str {
        match self {
            Rate::PerTick => "PerTickBlock",
            Rate::PerPass => "PerPassBlock",
            Rate::PerCamera => "PerCameraBlock",
            Rate::PerLevel => "PerLevelBlock",
            Rate::PerRenderable => "PerRenderableBlock",
            Rate::PerInstance => "PerInstanceBlock",
            Rate::PerVertex => "PerVertexBlock",
            Rate::PerPrimitive => "PerPrimitiveBlock",
            Rate::PerPixel => "PerPixelBlock",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_partition_into_sets() {
        assert!(Rate::PerTick.is_static());
        assert!(Rate::PerPass.is_static());
        for rate in Rate::DYNAMIC {
            assert!(rate.is_dynamic());
            assert!(!rate.is_static());
        }
        assert!(!Rate::PerPixel.is_static());
        assert!(!Rate::PerPixel.is_dynamic());
        assert_eq!(Rate::PerPixel.stage(), Some(ShaderStage::Pixel));
    }

    #[test]
    fn dynamic_order_runs_coarse_to_fine() {
        assert_eq!(Rate::PerCamera.dynamic_index(), Some(0));
        assert_eq!(Rate::PerLevel.dynamic_index(), Some(1));
        assert_eq!(Rate::PerInstance.dynamic_index(), Some(3));
        assert!(Rate::PerLevel < Rate::PerRenderable);
    }
}
