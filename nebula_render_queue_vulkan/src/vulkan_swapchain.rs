/// VulkanSwapchain - PresentSurface implementation over a caller-provided surface

use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use nebula_render_queue::nebula::device::{
    AcquiredImage, BackbufferImage, PresentSurface, RenderPassDescriptor,
};
use nebula_render_queue::nebula::render::LoadAction;
use nebula_render_queue::nebula::{Error, Result};
use nebula_render_queue::{nebula_error, nebula_info, nebula_warn};

use crate::vulkan_device::{build_render_pass, vk_err};
use crate::vulkan_framebuffer::depth_aspect_flags;

const LOG_SOURCE: &str = "nebula::swapchain";

/// Creation parameters for the swapchain
///
/// Surface-format negotiation happens before this crate is involved; the
/// caller passes the format pair it already chose. `depth_format` must match
/// the one given to the framebuffer factory so every pass in the scheduler's
/// cache stays compatible.
#[derive(Debug, Clone, Copy)]
pub struct VulkanSwapchainDesc {
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub depth_format: vk::Format,
    pub present_queue: vk::Queue,
    /// Number of acquire semaphores rotated across frames
    pub frames_in_flight: usize,
    /// Extent used when the surface does not report a fixed one
    pub fallback_extent: vk::Extent2D,
}

/// Vulkan swapchain with the shared depth attachment and per-image
/// framebuffers the backbuffer pass renders into
///
/// Takes ownership of the surface handle and destroys it on drop. The
/// swapchain images stay attachment-optimal from the scheduler's point of
/// view; acquisition and presentation ordering runs through the per-frame
/// acquire semaphores and per-image render-complete semaphores.
pub struct VulkanSwapchain {
    /// Vulkan logical device handle
    device: ash::Device,
    /// Physical device, for surface capability queries on recreate
    physical_device: vk::PhysicalDevice,
    /// Queue presentation happens on
    present_queue: vk::Queue,
    /// Window surface (owned)
    surface: vk::SurfaceKHR,
    /// Surface extension loader
    surface_loader: ash::khr::surface::Instance,
    /// Swapchain handle
    swapchain: vk::SwapchainKHR,
    /// Swapchain extension loader
    swapchain_loader: ash::khr::swapchain::Device,
    /// Swapchain images (owned by the swapchain itself)
    images: Vec<vk::Image>,
    /// One view per swapchain image
    views: Vec<vk::ImageView>,
    /// One framebuffer per swapchain image, bound against `framebuffer_pass`
    framebuffers: Vec<vk::Framebuffer>,
    /// Color format of the swapchain images
    color_format: vk::Format,
    /// Color space matching `color_format`
    color_space: vk::ColorSpaceKHR,
    /// Format of the shared depth attachment
    depth_format: vk::Format,
    /// Current swapchain extent
    extent: vk::Extent2D,
    /// Extent used when the surface does not report one
    fallback_extent: vk::Extent2D,
    /// Shared depth image backing every framebuffer
    depth_image: vk::Image,
    depth_view: vk::ImageView,
    depth_allocation: Option<Allocation>,
    /// GPU memory allocator, shared with the framebuffer factory
    allocator: Arc<Mutex<Allocator>>,
    /// Per-frame semaphores signaled by image acquisition
    acquire_semaphores: Vec<vk::Semaphore>,
    /// Per-image semaphores signaled by frame submission, waited on by present
    render_complete_semaphores: Vec<vk::Semaphore>,
    /// Pass the current framebuffers were created against
    framebuffer_pass: vk::RenderPass,
    /// Whether `framebuffer_pass` is the internal compatibility pass built
    /// at construction (replaced by the scheduler's pass on first recreate)
    owns_framebuffer_pass: bool,
    current_frame: usize,
    frames_in_flight: usize,
}

impl VulkanSwapchain {
    /// Build the swapchain, its views, the shared depth buffer, the
    /// per-image framebuffers and the semaphore sets
    ///
    /// # Errors
    ///
    /// `Error::InitializationFailed` for invalid parameters or any driver
    /// failure during setup.
    pub fn new(
        device: ash::Device,
        surface_loader: ash::khr::surface::Instance,
        swapchain_loader: ash::khr::swapchain::Device,
        allocator: Arc<Mutex<Allocator>>,
        desc: &VulkanSwapchainDesc,
    ) -> Result<Self> {
        if desc.frames_in_flight == 0 {
            nebula_error!(LOG_SOURCE, "frames_in_flight must be at least 1");
            return Err(Error::InitializationFailed(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }

        unsafe {
            let capabilities = surface_loader
                .get_physical_device_surface_capabilities(desc.physical_device, desc.surface)
                .map_err(|e| {
                    nebula_error!(LOG_SOURCE, "Failed to get surface capabilities: {:?}", e);
                    Error::InitializationFailed(format!(
                        "Failed to get surface capabilities: {:?}",
                        e
                    ))
                })?;

            let extent = Self::choose_extent(&capabilities, desc.fallback_extent);
            if extent.width == 0 || extent.height == 0 {
                nebula_error!(LOG_SOURCE, "Surface reports a zero extent");
                return Err(Error::InitializationFailed(
                    "surface reports a zero extent".to_string(),
                ));
            }

            let swapchain_create_info = vk::SwapchainCreateInfoKHR::default()
                .surface(desc.surface)
                .min_image_count(Self::clamped_image_count(&capabilities))
                .image_format(desc.surface_format.format)
                .image_color_space(desc.surface_format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                )
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(vk::PresentModeKHR::FIFO)
                .clipped(true);

            let swapchain = swapchain_loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(|e| {
                    nebula_error!(LOG_SOURCE, "Failed to create swapchain: {:?}", e);
                    Error::InitializationFailed(format!("Failed to create swapchain: {:?}", e))
                })?;

            let images = swapchain_loader.get_swapchain_images(swapchain).map_err(|e| {
                nebula_error!(LOG_SOURCE, "Failed to get swapchain images: {:?}", e);
                Error::InitializationFailed(format!("Failed to get swapchain images: {:?}", e))
            })?;

            let views = Self::create_image_views(&device, &images, desc.surface_format.format)?;

            let (depth_image, depth_view, depth_allocation) =
                Self::create_depth_buffer(&device, &allocator, extent, desc.depth_format)?;

            // The scheduler's backbuffer pass does not exist yet at this
            // point, so the first framebuffer set is built against an
            // internal pass with the same attachment formats.
            let framebuffer_pass = build_render_pass(
                &device,
                LOG_SOURCE,
                &RenderPassDescriptor {
                    color_load: LoadAction::Clear,
                    depth_load: LoadAction::Clear,
                    color_format: desc.surface_format.format,
                    depth_format: desc.depth_format,
                    for_backbuffer: true,
                },
            )?;

            let framebuffers =
                Self::create_framebuffers(&device, framebuffer_pass, &views, depth_view, extent)?;

            let acquire_semaphores = Self::create_semaphores(&device, desc.frames_in_flight)?;
            let render_complete_semaphores = Self::create_semaphores(&device, images.len())?;

            nebula_info!(
                LOG_SOURCE,
                "swapchain ready: {}x{}, {} images, {:?}",
                extent.width,
                extent.height,
                images.len(),
                desc.surface_format.format
            );

            Ok(Self {
                device,
                physical_device: desc.physical_device,
                present_queue: desc.present_queue,
                surface: desc.surface,
                surface_loader,
                swapchain,
                swapchain_loader,
                images,
                views,
                framebuffers,
                color_format: desc.surface_format.format,
                color_space: desc.surface_format.color_space,
                depth_format: desc.depth_format,
                extent,
                fallback_extent: desc.fallback_extent,
                depth_image,
                depth_view,
                depth_allocation: Some(depth_allocation),
                allocator,
                acquire_semaphores,
                render_complete_semaphores,
                framebuffer_pass,
                owns_framebuffer_pass: true,
                current_frame: 0,
                frames_in_flight: desc.frames_in_flight,
            })
        }
    }

    // ===== CREATION HELPERS =====

    fn choose_extent(
        capabilities: &vk::SurfaceCapabilitiesKHR,
        fallback: vk::Extent2D,
    ) -> vk::Extent2D {
        if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: fallback.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: fallback.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        }
    }

    fn clamped_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
        let count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            count.min(capabilities.max_image_count)
        } else {
            count
        }
    }

    fn create_image_views(
        device: &ash::Device,
        images: &[vk::Image],
        format: vk::Format,
    ) -> Result<Vec<vk::ImageView>> {
        unsafe {
            images
                .iter()
                .map(|&image| {
                    let create_info = vk::ImageViewCreateInfo::default()
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
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    device.create_image_view(&create_info, None)
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to create swapchain image views", e))
        }
    }

    fn create_depth_buffer(
        device: &ash::Device,
        allocator: &Mutex<Allocator>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<(vk::Image, vk::ImageView, Allocation)> {
        unsafe {
            let image_create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);

            let image = device
                .create_image(&image_create_info, None)
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to create depth image", e))?;

            let requirements = device.get_image_memory_requirements(image);

            let allocation = allocator
                .lock()
                .unwrap()
                .allocate(&AllocationCreateDesc {
                    name: "swapchain depth",
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|_e| {
                    let size_mb = requirements.size as f64 / (1024.0 * 1024.0);
                    nebula_error!(
                        LOG_SOURCE,
                        "Out of GPU memory for depth buffer ({}x{}, {:.2} MB)",
                        extent.width,
                        extent.height,
                        size_mb
                    );
                    Error::OutOfMemory
                })?;

            device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to bind depth image memory", e))?;

            let view_create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: depth_aspect_flags(format),
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = device
                .create_image_view(&view_create_info, None)
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to create depth image view", e))?;

            Ok((image, view, allocation))
        }
    }

    fn create_framebuffers(
        device: &ash::Device,
        pass: vk::RenderPass,
        views: &[vk::ImageView],
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Vec<vk::Framebuffer>> {
        unsafe {
            views
                .iter()
                .map(|&view| {
                    let attachments = [view, depth_view];
                    let framebuffer_info = vk::FramebufferCreateInfo::default()
                        .render_pass(pass)
                        .attachments(&attachments)
                        .width(extent.width)
                        .height(extent.height)
                        .layers(1);
                    device.create_framebuffer(&framebuffer_info, None)
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to create backbuffer framebuffers", e))
        }
    }

    fn create_semaphores(device: &ash::Device, count: usize) -> Result<Vec<vk::Semaphore>> {
        let create_info = vk::SemaphoreCreateInfo::default();
        (0..count)
            .map(|_| unsafe { device.create_semaphore(&create_info, None) })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to create semaphores", e))
    }

    fn destroy_image_objects(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.framebuffers.clear();

            for &view in &self.views {
                self.device.destroy_image_view(view, None);
            }
            self.views.clear();
            self.images.clear();

            if self.depth_view != vk::ImageView::null() {
                self.device.destroy_image_view(self.depth_view, None);
                self.depth_view = vk::ImageView::null();
            }
            if let Some(allocation) = self.depth_allocation.take() {
                self.allocator.lock().unwrap().free(allocation).ok();
            }
            if self.depth_image != vk::Image::null() {
                self.device.destroy_image(self.depth_image, None);
                self.depth_image = vk::Image::null();
            }
        }
    }
}

impl PresentSurface for VulkanSwapchain {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn color_format(&self) -> vk::Format {
        self.color_format
    }

    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn backbuffer(&self, image_index: u32) -> Result<BackbufferImage> {
        let index = image_index as usize;
        if index >= self.images.len() {
            nebula_error!(
                LOG_SOURCE,
                "image_index {} out of range ({} swapchain images)",
                image_index,
                self.images.len()
            );
            return Err(Error::InvalidResource(format!(
                "image_index {} out of range ({} swapchain images)",
                image_index,
                self.images.len()
            )));
        }
        Ok(BackbufferImage {
            image: self.images[index],
            view: self.views[index],
            framebuffer: self.framebuffers[index],
        })
    }

    fn acquire_image(&mut self) -> Result<AcquiredImage> {
        let acquire_semaphore = self.acquire_semaphores[self.current_frame];

        let (image_index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                acquire_semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                nebula_warn!(LOG_SOURCE, "Swapchain out of date during acquire");
                Error::SurfaceOutOfDate
            }
            other => vk_err(LOG_SOURCE, "Failed to acquire swapchain image", other),
        })?;

        Ok(AcquiredImage {
            image_index,
            acquire_semaphore,
            render_complete_semaphore: self.render_complete_semaphores[image_index as usize],
            suboptimal,
        })
    }

    fn present(&mut self, image_index: u32) -> Result<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [self.render_complete_semaphores[image_index as usize]];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present_info)
        } {
            Ok(_suboptimal) => {
                self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
                nebula_warn!(LOG_SOURCE, "Swapchain out of date during present");
                Err(Error::SurfaceOutOfDate)
            }
            Err(e) => Err(vk_err(LOG_SOURCE, "Failed to present swapchain image", e)),
        }
    }

    fn recreate(&mut self, backbuffer_pass: vk::RenderPass) -> Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to wait idle before recreate", e))?;

            self.destroy_image_objects();

            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to get surface capabilities", e))?;

            let extent = Self::choose_extent(&capabilities, self.fallback_extent);
            if extent.width == 0 || extent.height == 0 {
                nebula_warn!(LOG_SOURCE, "Surface extent is zero, deferring recreate");
                return Err(Error::SurfaceOutOfDate);
            }

            let swapchain_create_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(Self::clamped_image_count(&capabilities))
                .image_format(self.color_format)
                .image_color_space(self.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                )
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(vk::PresentModeKHR::FIFO)
                .clipped(true)
                .old_swapchain(self.swapchain);

            let swapchain = self
                .swapchain_loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to recreate swapchain", e))?;

            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = swapchain;
            self.extent = extent;

            self.images = self
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(|e| vk_err(LOG_SOURCE, "Failed to get swapchain images", e))?;

            self.views =
                Self::create_image_views(&self.device, &self.images, self.color_format)?;

            let (depth_image, depth_view, depth_allocation) = Self::create_depth_buffer(
                &self.device,
                &self.allocator,
                extent,
                self.depth_format,
            )?;
            self.depth_image = depth_image;
            self.depth_view = depth_view;
            self.depth_allocation = Some(depth_allocation);

            // From here on the framebuffers follow the scheduler's own
            // backbuffer pass instead of the construction-time stand-in.
            if self.owns_framebuffer_pass {
                self.device.destroy_render_pass(self.framebuffer_pass, None);
                self.owns_framebuffer_pass = false;
            }
            self.framebuffer_pass = backbuffer_pass;

            self.framebuffers = Self::create_framebuffers(
                &self.device,
                self.framebuffer_pass,
                &self.views,
                self.depth_view,
                extent,
            )?;

            // Image count can change across recreates; the per-image
            // semaphore set is rebuilt to match.
            for &semaphore in &self.render_complete_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.render_complete_semaphores =
                Self::create_semaphores(&self.device, self.images.len())?;

            nebula_info!(
                LOG_SOURCE,
                "swapchain recreated at {}x{} ({} images)",
                extent.width,
                extent.height,
                self.images.len()
            );
            Ok(())
        }
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();

            for &semaphore in &self.acquire_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            for &semaphore in &self.render_complete_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }

            self.destroy_image_objects();

            self.swapchain_loader.destroy_swapchain(self.swapchain, None);

            if self.owns_framebuffer_pass {
                self.device.destroy_render_pass(self.framebuffer_pass, None);
            }

            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
