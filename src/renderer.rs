//! Owns the device and drives one frame per `draw`.

use std::collections::{BTreeSet, HashMap};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec2;
use vulkanalia::loader::{LibloadingLoader, LIBRARY};
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::{ExtDebugUtilsExtension, KhrSurfaceExtension};
use vulkanalia::window as vk_window;
use winit::window::Window;

use crate::asset::{Mesh, Texture};
use crate::config::RendererConfig;
use crate::content::{GeometryContent, TextureContent};
use crate::context::{PipelineId, PipelineStore, RenderContext};
use crate::descriptor::Descriptor;
use crate::device::{self, QueueFamilyIndices, SwapchainSupport};
use crate::error::{Error, Result};
use crate::layer::{Layer, Style};
use crate::pipeline::Pipeline;
use crate::recorder::{CommandRecorder, RenderPassInfo, VkRecorder};
use crate::render_pass::{self, DEPTH_FORMAT};
use crate::scene::{Scene, ThingId};
use crate::swapchain::{self, SurfaceBinding, Swapchain};
use crate::traits::{Trait, TraitTag};
use crate::vram::Vram;

/// Render passes and the pool frame command buffers come from.
struct FrameTargets {
    device: Arc<Device>,
    /// Clears color; used by the first layer of a frame.
    clear_pass: vk::RenderPass,
    /// Keeps what earlier layers drew.
    load_pass: vk::RenderPass,
    command_pool: vk::CommandPool,
}

impl FrameTargets {
    unsafe fn new(device: Arc<Device>, color_format: vk::Format, graphics_family: u32) -> Result<Self> {
        let mut targets = Self {
            device,
            clear_pass: vk::RenderPass::null(),
            load_pass: vk::RenderPass::null(),
            command_pool: vk::CommandPool::null(),
        };
        targets.clear_pass = render_pass::create_render_pass(&targets.device, color_format, false)?;
        targets.load_pass = render_pass::create_render_pass(&targets.device, color_format, true)?;

        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_family);
        targets.command_pool = targets.device.create_command_pool(&info, None)?;
        Ok(targets)
    }
}

impl Drop for FrameTargets {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_render_pass(self.load_pass, None);
            self.device.destroy_render_pass(self.clear_pass, None);
        }
    }
}

pub struct Renderer {
    #[allow(dead_code)]
    entry: Entry,
    instance: Instance,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
    device: Arc<Device>,
    present_queue: vk::Queue,

    vram: ManuallyDrop<Vram>,
    targets: ManuallyDrop<FrameTargets>,
    swapchain: ManuallyDrop<Swapchain>,

    config: RendererConfig,
    attachment_formats: Vec<vk::Format>,
    min_ubo_alignment: u64,
    resolution: vk::Extent2D,

    store: PipelineStore,
    geometry: HashMap<u64, Arc<GeometryContent>>,
    textures: HashMap<u64, Arc<TextureContent>>,
    layers: Vec<Layer>,

    started: Instant,
    mouse_position: Vec2,
    mouse_scroll: Vec2,
}

/// Instance-level objects, released together when device setup fails.
struct InstanceParts {
    entry: Entry,
    instance: Instance,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface: vk::SurfaceKHR,
}

impl InstanceParts {
    unsafe fn destroy(&self) {
        self.instance.destroy_surface_khr(self.surface, None);
        if let Some(messenger) = self.messenger {
            self.instance.destroy_debug_utils_messenger_ext(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

impl Renderer {
    pub fn new(window: &Window, config: RendererConfig) -> Result<Self> {
        unsafe {
            let loader = LibloadingLoader::new(LIBRARY).map_err(|e| Error::Loader(e.to_string()))?;
            let entry = Entry::new(loader).map_err(|e| Error::Loader(e.to_string()))?;
            let (instance, messenger) = device::create_instance(
                window,
                &entry,
                &config.application_name,
                config.validation,
            )?;

            let surface = match vk_window::create_surface(&instance, window, window) {
                Ok(surface) => surface,
                Err(e) => {
                    if let Some(messenger) = messenger {
                        instance.destroy_debug_utils_messenger_ext(messenger, None);
                    }
                    instance.destroy_instance(None);
                    return Err(e.into());
                }
            };

            let parts = InstanceParts {
                entry,
                instance,
                messenger,
                surface,
            };
            let requested = extent_of(window).unwrap_or(vk::Extent2D {
                width: config.initial_extent.0,
                height: config.initial_extent.1,
            });
            match Self::on_device(&parts, config, requested) {
                Ok(renderer) => Ok(renderer),
                Err(e) => {
                    parts.destroy();
                    Err(e)
                }
            }
        }
    }

    unsafe fn on_device(parts: &InstanceParts, config: RendererConfig, requested: vk::Extent2D) -> Result<Self> {
        let (physical_device, indices) = device::pick_physical_device(&parts.instance, parts.surface)?;
        let (device, queues) =
            device::create_logical_device(&parts.instance, physical_device, &indices, config.validation)?;
        let device = Arc::new(device);

        match Self::with_device(parts, config, requested, physical_device, indices, device.clone(), queues) {
            Ok(renderer) => Ok(renderer),
            Err(e) => {
                device.destroy_device(None);
                Err(e)
            }
        }
    }

    unsafe fn with_device(
        parts: &InstanceParts,
        config: RendererConfig,
        requested: vk::Extent2D,
        physical_device: vk::PhysicalDevice,
        indices: QueueFamilyIndices,
        device: Arc<Device>,
        [graphics_queue, present_queue, transfer_queue]: [vk::Queue; 3],
    ) -> Result<Self> {
        let instance = &parts.instance;
        let vram = Vram::new(instance, physical_device, device.clone(), indices.transfer, transfer_queue)?;

        let support = SwapchainSupport::get(instance, parts.surface, physical_device)?;
        let color_format = swapchain::choose_surface_format(&support.formats)?.format;
        let targets = FrameTargets::new(device.clone(), color_format, indices.graphics)?;

        let binding = SurfaceBinding {
            surface: parts.surface,
            physical_device,
            indices,
            graphics_queue,
            present_queue,
            render_pass: targets.clear_pass,
            command_pool: targets.command_pool,
            prefer_mailbox: config.prefer_mailbox,
        };
        let swapchain = Swapchain::new(instance, &vram, binding, requested)?;
        let min_ubo_alignment = device::min_ubo_alignment(instance, physical_device);

        log::info!(
            "Renderer ready: {:?}, min UBO alignment {min_ubo_alignment}",
            swapchain.surface_format().format
        );

        Ok(Self {
            entry: parts.entry.clone(),
            instance: instance.clone(),
            messenger: parts.messenger,
            surface: parts.surface,
            physical_device,
            indices,
            device,
            present_queue,
            vram: ManuallyDrop::new(vram),
            targets: ManuallyDrop::new(targets),
            attachment_formats: vec![swapchain.surface_format().format, DEPTH_FORMAT],
            resolution: requested,
            swapchain: ManuallyDrop::new(swapchain),
            config,
            min_ubo_alignment,
            store: PipelineStore::new(),
            geometry: HashMap::new(),
            textures: HashMap::new(),
            layers: Vec::new(),
            started: Instant::now(),
            mouse_position: Vec2::ZERO,
            mouse_scroll: Vec2::ZERO,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.indices
    }

    /// Draws everything below `owner` in a layer of its own, on top of the
    /// layers added before.
    pub fn add_layer(&mut self, owner: ThingId, style: Style) -> usize {
        self.layers.push(Layer::new(owner, style));
        self.layers.len() - 1
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn set_mouse_position(&mut self, position: Vec2) {
        self.mouse_position = position;
    }

    pub fn set_mouse_scroll(&mut self, scroll: Vec2) {
        self.mouse_scroll = scroll;
    }

    /// Renders one frame of `scene` to `window`. Returns whether a frame was
    /// presented; skipped and lost frames return false.
    pub fn draw(&mut self, scene: &mut Scene, window: &Window) -> Result<bool> {
        let Some(extent) = extent_of(window) else {
            return Ok(false);
        };

        unsafe {
            if extent != self.resolution {
                log::debug!("Resolution changed to {}x{}", extent.width, extent.height);
                self.swapchain.recreate(&self.instance, &self.vram, extent)?;
                self.resolution = extent;
            }
            self.device.queue_wait_idle(self.present_queue)?;
        }

        for pipeline in self.store.iter_mut() {
            pipeline.reset_uniforms();
        }

        let mut layers = std::mem::take(&mut self.layers);
        let result = self.draw_layers(scene, &mut layers);
        self.layers = layers;
        result
    }

    fn draw_layers(&mut self, scene: &mut Scene, layers: &mut [Layer]) -> Result<bool> {
        let mut relevant = BTreeSet::new();
        let mut active = Vec::with_capacity(layers.len());
        for layer in layers.iter_mut() {
            active.push(layer.generate(scene, self, &mut relevant)?);
        }

        let tick = [
            Trait::float(TraitTag::Time, self.started.elapsed().as_secs_f32()),
            Trait::vec2(TraitTag::MousePosition, self.mouse_position),
            Trait::vec2(TraitTag::MouseScroll, self.mouse_scroll),
        ];
        for id in &relevant {
            let pipeline = self.store.get_mut(*id);
            for value in &tick {
                pipeline.set_uniform(value);
            }
            unsafe { pipeline.upload(&self.vram)? };
        }

        unsafe {
            if !self.swapchain.start_rendering() {
                return Ok(false);
            }
        }

        let mut info = RenderPassInfo {
            render_pass: self.targets.clear_pass,
            framebuffer: self.swapchain.framebuffer(),
            extent: self.swapchain.extent(),
            clear_color: self.config.clear_color,
            clear_depth: self.config.clear_depth,
        };
        let mut rec = VkRecorder::new(&self.device, self.swapchain.command_buffer());
        let mut recorded = false;
        for (layer, _) in layers.iter().zip(&active).filter(|(_, active)| **active) {
            layer.render(&mut rec, self, &info);
            info.render_pass = self.targets.load_pass;
            recorded = true;
        }
        if !recorded {
            rec.begin_render_pass(&info);
            rec.end_render_pass();
        }

        Ok(unsafe { self.swapchain.end_rendering() })
    }
}

/// Drawable size of the window, or `None` while it is minimized.
fn extent_of(window: &Window) -> Option<vk::Extent2D> {
    if window.is_minimized().unwrap_or(false) {
        return None;
    }
    let size = window.inner_size();
    (size.width > 0 && size.height > 0).then_some(vk::Extent2D {
        width: size.width,
        height: size.height,
    })
}

impl RenderContext for Renderer {
    fn window_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    fn min_ubo_alignment(&self) -> u64 {
        self.min_ubo_alignment
    }

    fn attachment_formats(&self) -> &[vk::Format] {
        &self.attachment_formats
    }

    fn pipeline_for(&mut self, descriptor: &Descriptor) -> Result<PipelineId> {
        let (id, _) = self
            .store
            .request(descriptor, &self.attachment_formats, self.min_ubo_alignment)?;
        let pipeline = self.store.get_mut(id);
        if !pipeline.is_initialized() {
            unsafe { pipeline.initialize(&self.device, self.targets.clear_pass)? };
        }
        Ok(id)
    }

    fn pipeline(&self, id: PipelineId) -> &Pipeline {
        self.store.get(id)
    }

    fn pipeline_mut(&mut self, id: PipelineId) -> &mut Pipeline {
        self.store.get_mut(id)
    }

    fn geometry_for(&mut self, mesh: &Arc<Mesh>) -> Result<Arc<GeometryContent>> {
        if let Some(geometry) = self.geometry.get(&mesh.hash()) {
            return Ok(geometry.clone());
        }
        let geometry = Arc::new(unsafe { GeometryContent::upload(&self.vram, mesh)? });
        self.geometry.insert(mesh.hash(), geometry.clone());
        Ok(geometry)
    }

    fn texture_for(&mut self, texture: &Arc<Texture>) -> Result<Arc<TextureContent>> {
        if let Some(content) = self.textures.get(&texture.hash()) {
            return Ok(content.clone());
        }
        let content = Arc::new(unsafe { TextureContent::upload(&self.vram, texture)? });
        self.textures.insert(texture.hash(), content.clone());
        Ok(content)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for the device before teardown: {e}");
            }

            self.layers.clear();
            self.store.clear();
            self.geometry.clear();
            self.textures.clear();

            ManuallyDrop::drop(&mut self.swapchain);
            ManuallyDrop::drop(&mut self.targets);
            ManuallyDrop::drop(&mut self.vram);

            log::debug!(
                "Releasing device of {:?}",
                self.instance
                    .get_physical_device_properties(self.physical_device)
                    .device_name
            );
            self.device.destroy_device(None);
            self.instance.destroy_surface_khr(self.surface, None);
            if let Some(messenger) = self.messenger {
                self.instance.destroy_debug_utils_messenger_ext(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
