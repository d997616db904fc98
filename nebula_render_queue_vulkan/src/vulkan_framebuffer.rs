/// VulkanFramebufferFactory - offscreen image allocation for the scheduler

use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use rustc_hash::FxHashMap;

use nebula_render_queue::nebula::device::RenderPassDescriptor;
use nebula_render_queue::nebula::render::{
    Attachment, Framebuffer, LoadAction, OFFSCREEN_COLOR_FORMAT,
};
use nebula_render_queue::nebula::{Error, Result};
use nebula_render_queue::{nebula_debug, nebula_error, nebula_warn};

use crate::vulkan_device::{build_render_pass, vk_err};

const LOG_SOURCE: &str = "nebula::vulkan";

/// Aspect flags implied by a depth/stencil format
pub(crate) fn depth_aspect_flags(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

/// Everything owned by one live framebuffer, kept for destruction
struct FramebufferMemory {
    framebuffer: vk::Framebuffer,
    color: Attachment,
    depth: Attachment,
    color_allocation: Allocation,
    depth_allocation: Allocation,
}

/// Creates and destroys offscreen render targets
///
/// Color attachments always use `OFFSCREEN_COLOR_FORMAT`; depth uses the
/// format the scheduler's render pass cache was built with, so the factory
/// and the presentation surface must be given the same one. Image memory
/// comes from gpu-allocator and is returned on destruction. Framebuffers
/// must only be destroyed once the GPU is done with every frame that
/// referenced them.
pub struct VulkanFramebufferFactory {
    /// Vulkan logical device handle
    device: ash::Device,
    /// GPU memory allocator, shared with the rest of the application
    allocator: Arc<Mutex<Allocator>>,
    /// Depth/stencil format of every created framebuffer
    depth_format: vk::Format,
    /// Pass the `vk::Framebuffer`s are created against; compatible with
    /// every entry of the scheduler's offscreen pass table
    creation_pass: vk::RenderPass,
    /// Allocations and handles of live framebuffers, keyed by id
    live: FxHashMap<u64, FramebufferMemory>,
}

impl VulkanFramebufferFactory {
    /// Build a factory for the given depth/stencil format
    ///
    /// # Errors
    ///
    /// `Error::BackendError` if the internal creation pass cannot be built.
    pub fn new(
        device: ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let creation_pass = build_render_pass(
            &device,
            LOG_SOURCE,
            &RenderPassDescriptor {
                color_load: LoadAction::Clear,
                depth_load: LoadAction::Clear,
                color_format: OFFSCREEN_COLOR_FORMAT,
                depth_format,
                for_backbuffer: false,
            },
        )?;

        Ok(Self {
            device,
            allocator,
            depth_format,
            creation_pass,
            live: FxHashMap::default(),
        })
    }

    /// Allocate a color+depth framebuffer of the given size
    ///
    /// # Errors
    ///
    /// `Error::InvalidResource` for a zero-sized request, `Error::OutOfMemory`
    /// when the allocator cannot satisfy it.
    pub fn create_framebuffer(&mut self, width: u32, height: u32) -> Result<Arc<Framebuffer>> {
        if width == 0 || height == 0 {
            nebula_error!(
                LOG_SOURCE,
                "Rejected zero-sized framebuffer request ({}x{})",
                width,
                height
            );
            return Err(Error::InvalidResource(format!(
                "framebuffer extent {}x{} is empty",
                width, height
            )));
        }

        let (color, color_allocation) = self.create_attachment(
            width,
            height,
            OFFSCREEN_COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
            "framebuffer color",
        )?;

        let (depth, depth_allocation) = match self.create_attachment(
            width,
            height,
            self.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            depth_aspect_flags(self.depth_format),
            "framebuffer depth",
        ) {
            Ok(pair) => pair,
            Err(err) => {
                self.destroy_attachment(&color, color_allocation);
                return Err(err);
            }
        };

        let attachments = [color.view, depth.view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(self.creation_pass)
            .attachments(&attachments)
            .width(width)
            .height(height)
            .layers(1);

        let vk_framebuffer =
            match unsafe { self.device.create_framebuffer(&framebuffer_info, None) } {
                Ok(handle) => handle,
                Err(e) => {
                    self.destroy_attachment(&depth, depth_allocation);
                    self.destroy_attachment(&color, color_allocation);
                    return Err(vk_err(LOG_SOURCE, "Failed to create framebuffer", e));
                }
            };

        let framebuffer = Arc::new(Framebuffer::new(width, height, vk_framebuffer, color, depth));
        self.live.insert(
            framebuffer.id(),
            FramebufferMemory {
                framebuffer: vk_framebuffer,
                color,
                depth,
                color_allocation,
                depth_allocation,
            },
        );

        nebula_debug!(
            LOG_SOURCE,
            "created framebuffer {} ({}x{})",
            framebuffer.id(),
            width,
            height
        );
        Ok(framebuffer)
    }

    /// Destroy a framebuffer created by this factory, returning its memory
    ///
    /// The caller guarantees the GPU is idle for every frame that used the
    /// framebuffer.
    ///
    /// # Errors
    ///
    /// `Error::InvalidResource` if the framebuffer is not live in this
    /// factory.
    pub fn destroy_framebuffer(&mut self, framebuffer: &Framebuffer) -> Result<()> {
        if !self.release(framebuffer.id()) {
            nebula_error!(
                LOG_SOURCE,
                "destroy_framebuffer: framebuffer {} is not live in this factory",
                framebuffer.id()
            );
            return Err(Error::InvalidResource(format!(
                "framebuffer {} was not created here or was already destroyed",
                framebuffer.id()
            )));
        }
        nebula_debug!(LOG_SOURCE, "destroyed framebuffer {}", framebuffer.id());
        Ok(())
    }

    /// Number of framebuffers currently alive
    pub fn live_framebuffers(&self) -> usize {
        self.live.len()
    }

    fn create_attachment(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspects: vk::ImageAspectFlags,
        name: &'static str,
    ) -> Result<(Attachment, Allocation)> {
        unsafe {
            let image_create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);

            let image = self
                .device
                .create_image(&image_create_info, None)
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to create attachment image", e))?;

            let requirements = self.device.get_image_memory_requirements(image);

            let allocation = match self.allocator.lock().unwrap().allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(_e) => {
                    let size_mb = requirements.size as f64 / (1024.0 * 1024.0);
                    nebula_error!(
                        LOG_SOURCE,
                        "Out of GPU memory for {} ({}x{}, {:.2} MB)",
                        name,
                        width,
                        height,
                        size_mb
                    );
                    self.device.destroy_image(image, None);
                    return Err(Error::OutOfMemory);
                }
            };

            if let Err(e) = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.allocator.lock().unwrap().free(allocation).ok();
                self.device.destroy_image(image, None);
                return Err(vk_err(LOG_SOURCE, "Failed to bind attachment memory", e));
            }

            let view_create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: aspects,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = match self.device.create_image_view(&view_create_info, None) {
                Ok(view) => view,
                Err(e) => {
                    self.allocator.lock().unwrap().free(allocation).ok();
                    self.device.destroy_image(image, None);
                    return Err(vk_err(LOG_SOURCE, "Failed to create attachment view", e));
                }
            };

            Ok((
                Attachment {
                    image,
                    view,
                    format,
                },
                allocation,
            ))
        }
    }

    fn destroy_attachment(&mut self, attachment: &Attachment, allocation: Allocation) {
        unsafe {
            self.device.destroy_image_view(attachment.view, None);
            self.allocator.lock().unwrap().free(allocation).ok();
            self.device.destroy_image(attachment.image, None);
        }
    }

    fn release(&mut self, id: u64) -> bool {
        let Some(memory) = self.live.remove(&id) else {
            return false;
        };
        unsafe {
            self.device.destroy_framebuffer(memory.framebuffer, None);
        }
        self.destroy_attachment(&memory.color, memory.color_allocation);
        self.destroy_attachment(&memory.depth, memory.depth_allocation);
        true
    }
}

impl Drop for VulkanFramebufferFactory {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            nebula_warn!(
                LOG_SOURCE,
                "{} framebuffers still live at factory drop",
                self.live.len()
            );
            let ids: Vec<u64> = self.live.keys().copied().collect();
            for id in ids {
                self.release(id);
            }
        }
        unsafe {
            self.device.destroy_render_pass(self.creation_pass, None);
        }
    }
}

#[cfg(test)]
#[path = "vulkan_framebuffer_tests.rs"]
mod tests;
