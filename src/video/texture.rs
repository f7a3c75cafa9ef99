//! GPU textures for decoded Hap frames
//!
//! [`TextureBackend`] is the seam between the upload path and the graphics
//! API. [`WgpuBackend`] writes BC-compressed frames into wgpu textures;
//! [`MemoryBackend`] keeps texture contents in host memory for headless use.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::hap::HapFormat;

/// Errors creating or writing textures
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    #[error("{0:?} textures are not supported by this device")]
    Unsupported(HapFormat),
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("failed to create GPU device: {0}")]
    Device(String),
    #[error("upload data is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("GPU validation error: {0}")]
    Validation(String),
    #[error("texture upload failed: {0}")]
    Backend(String),
}

/// Size and layout of a frame texture
///
/// Dimensions are rounded up to whole 4x4 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: HapFormat,
    /// Bytes per row of blocks
    pub bytes_per_row: u32,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: HapFormat) -> Self {
        let width = width.max(1).div_ceil(4) * 4;
        let height = height.max(1).div_ceil(4) * 4;
        Self {
            width,
            height,
            format,
            bytes_per_row: (width / 4) * format.bytes_per_block() as u32,
        }
    }

    /// Number of block rows
    pub fn block_rows(&self) -> u32 {
        self.height / 4
    }

    /// Bytes of one full frame
    pub fn data_size(&self) -> usize {
        self.bytes_per_row as usize * self.block_rows() as usize
    }

    fn check_size(&self, data: &[u8]) -> Result<(), UploadError> {
        if data.len() != self.data_size() {
            return Err(UploadError::SizeMismatch {
                expected: self.data_size(),
                actual: data.len(),
            });
        }
        Ok(())
    }
}

/// Graphics API used to hold frame textures
pub trait TextureBackend: Send + Sync + 'static {
    type Texture: Send + Sync + 'static;

    fn create_texture(&self, desc: &TextureDesc, label: &str)
        -> Result<Self::Texture, UploadError>;

    /// Copy a full frame into `texture`, returning once the copy has completed
    fn write_texture(
        &self,
        texture: &Self::Texture,
        desc: &TextureDesc,
        data: &[u8],
    ) -> Result<(), UploadError>;

    /// Whether uploads may run on a worker thread
    fn supports_async_upload(&self) -> bool;
}

/// A wgpu frame texture
pub struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

impl WgpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Get the texture view
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.desc.format.texture_format()
    }
}

/// wgpu backend sharing the host's device and queue
///
/// wgpu keeps one error-scope stack per device, shared by every thread. A
/// backend built on the host's device therefore leaves scopes off: pushing
/// one from the upload worker could capture errors raised by the host's
/// render thread. Validation errors then reach the device's uncaptured error
/// handler. [`WgpuBackend::new_headless`] owns its device and uses scopes.
#[derive(Clone)]
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    bc_texture_supported: bool,
    error_scopes: bool,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let bc_texture_supported = device
            .features()
            .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
        if !bc_texture_supported {
            log::warn!("BC texture compression not available - HAP playback disabled");
        }
        Self {
            device,
            queue,
            bc_texture_supported,
            error_scopes: false,
        }
    }

    /// Capture validation errors with error scopes; only safe when no other
    /// thread records work on the same device
    pub fn with_error_scopes(mut self, enabled: bool) -> Self {
        self.error_scopes = enabled;
        self
    }

    pub fn uses_error_scopes(&self) -> bool {
        self.error_scopes
    }

    /// Create a device with no surface, requesting BC texture compression
    pub fn new_headless() -> Result<Self, UploadError> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or(UploadError::NoAdapter)?;

            log::info!("Using GPU: {}", adapter.get_info().name);

            let mut required_features = wgpu::Features::empty();
            if adapter
                .features()
                .contains(wgpu::Features::TEXTURE_COMPRESSION_BC)
            {
                required_features |= wgpu::Features::TEXTURE_COMPRESSION_BC;
            }

            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("HAP Player Device"),
                        required_features,
                        required_limits: wgpu::Limits::default(),
                        memory_hints: wgpu::MemoryHints::Performance,
                    },
                    None,
                )
                .await
                .map_err(|e| UploadError::Device(e.to_string()))?;

            Ok::<_, UploadError>(
                Self::new(Arc::new(device), Arc::new(queue)).with_error_scopes(true),
            )
        })
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn bc_texture_supported(&self) -> bool {
        self.bc_texture_supported
    }

    fn push_validation_scope(&self) {
        if self.error_scopes {
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        }
    }

    fn pop_validation_error(&self) -> Result<(), UploadError> {
        if !self.error_scopes {
            return Ok(());
        }
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(UploadError::Validation(error.to_string())),
            None => Ok(()),
        }
    }
}

impl TextureBackend for WgpuBackend {
    type Texture = WgpuTexture;

    fn create_texture(&self, desc: &TextureDesc, label: &str) -> Result<WgpuTexture, UploadError> {
        if !self.bc_texture_supported {
            return Err(UploadError::Unsupported(desc.format));
        }

        self.push_validation_scope();
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.texture_format(),
            // COPY_DST for uploading data, TEXTURE_BINDING for shader sampling
            usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        self.pop_validation_error()?;

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        log::debug!(
            "Created {} texture {}x{} ({:?})",
            label,
            desc.width,
            desc.height,
            desc.format
        );

        Ok(WgpuTexture {
            texture,
            view,
            desc: *desc,
        })
    }

    fn write_texture(
        &self,
        texture: &WgpuTexture,
        desc: &TextureDesc,
        data: &[u8],
    ) -> Result<(), UploadError> {
        desc.check_size(data)?;

        self.push_validation_scope();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.bytes_per_row),
                rows_per_image: Some(desc.block_rows()),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        let submission = self.queue.submit(std::iter::empty());
        self.pop_validation_error()?;

        // Staged writes land with the submission; wait for it
        let _ = self.device.poll(wgpu::Maintain::wait_for(submission));
        Ok(())
    }

    fn supports_async_upload(&self) -> bool {
        true
    }
}

struct MemoryBackendState {
    live_textures: AtomicUsize,
    uploads: AtomicUsize,
    failures_to_inject: AtomicUsize,
    async_upload: AtomicBool,
    upload_delay: Mutex<Duration>,
}

/// Host-memory texture backend
///
/// Counts live textures and uploads, and can fail uploads on request. Used
/// for headless playback and in tests.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryBackendState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryBackendState {
                live_textures: AtomicUsize::new(0),
                uploads: AtomicUsize::new(0),
                failures_to_inject: AtomicUsize::new(0),
                async_upload: AtomicBool::new(true),
                upload_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Backend that reports no async upload support
    pub fn synchronous() -> Self {
        let backend = Self::new();
        backend.state.async_upload.store(false, Ordering::Relaxed);
        backend
    }

    pub fn live_textures(&self) -> usize {
        self.state.live_textures.load(Ordering::Acquire)
    }

    pub fn uploads(&self) -> usize {
        self.state.uploads.load(Ordering::Acquire)
    }

    /// Make the next `count` uploads fail
    pub fn fail_next_uploads(&self, count: usize) {
        self.state.failures_to_inject.store(count, Ordering::Release);
    }

    /// Slow every upload down by `delay`
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.state.upload_delay.lock() = delay;
    }
}

/// Texture held in host memory
pub struct MemoryTexture {
    label: String,
    desc: TextureDesc,
    pixels: Mutex<Vec<u8>>,
    state: Arc<MemoryBackendState>,
}

impl MemoryTexture {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    /// Copy of the current contents
    pub fn pixels(&self) -> Vec<u8> {
        self.pixels.lock().clone()
    }
}

impl Drop for MemoryTexture {
    fn drop(&mut self) {
        self.state.live_textures.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TextureBackend for MemoryBackend {
    type Texture = MemoryTexture;

    fn create_texture(&self, desc: &TextureDesc, label: &str) -> Result<MemoryTexture, UploadError> {
        self.state.live_textures.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryTexture {
            label: label.to_string(),
            desc: *desc,
            pixels: Mutex::new(vec![0; desc.data_size()]),
            state: Arc::clone(&self.state),
        })
    }

    fn write_texture(
        &self,
        texture: &MemoryTexture,
        desc: &TextureDesc,
        data: &[u8],
    ) -> Result<(), UploadError> {
        desc.check_size(data)?;

        let delay = *self.state.upload_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let inject = self
            .state
            .failures_to_inject
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(UploadError::Backend("injected failure".to_string()));
        }

        texture.pixels.lock().copy_from_slice(data);
        self.state.uploads.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn supports_async_upload(&self) -> bool {
        self.state.async_upload.load(Ordering::Relaxed)
    }
}
