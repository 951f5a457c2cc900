//! A Vulkan scene renderer: materials become pipelines, scene subtrees
//! become layers, and layers are recorded into swapchain frames.

pub mod asset;
pub mod camera;
pub mod config;
pub mod content;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod gpu;
pub mod layer;
pub mod lod;
pub mod material;
pub mod pipeline;
pub mod rate;
pub mod recorder;
pub mod render_pass;
pub mod renderable;
pub mod renderer;
pub mod scene;
pub mod shader;
pub mod swapchain;
pub mod traits;
pub mod ubo;
pub mod vram;

pub use asset::{Mesh, Texture, TextureMapping, Topology};
pub use camera::{Camera, Projection};
pub use config::RendererConfig;
pub use context::{HostContext, PipelineId, RenderContext};
pub use descriptor::{BlendMode, Descriptor, DescriptorItem};
pub use error::{Error, Result};
pub use layer::{Layer, Style};
pub use lod::{Level, Lod};
pub use rate::Rate;
pub use recorder::{CommandLog, CommandRecorder, RenderPassInfo};
pub use renderable::Renderable;
pub use renderer::Renderer;
pub use scene::{Instance, Scene, ThingId};
pub use traits::{Trait, TraitTag};
