//! Offscreen EGL renderer for DMA-BUF readback
//!
//! QEMU's GL scanouts arrive as DMA-BUF descriptors. Reading them on the
//! CPU requires importing the buffer as an EGL image, binding it to a
//! texture, attaching that to an offscreen framebuffer and reading the
//! pixels back as RGB.
//!
//! EGL contexts are only valid on the thread they were made current on, so
//! all GPU work is pinned to one dedicated worker thread; the dispatch
//! context marshals import requests to it and blocks for the (bounded)
//! readback. The context is created lazily on the first import and torn
//! down when the worker is dropped.

use std::ffi::c_void;
use std::ptr;
use std::sync::mpsc;
use std::thread::JoinHandle;

use khronos_egl::DynamicInstance;
use thiserror::Error;
use tracing::{debug, info, warn};

type Egl = DynamicInstance<khronos_egl::EGL1_4>;

// EGL_EXT_image_dma_buf_import attributes
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;
const EGL_DMA_BUF_PLANE0_FD_EXT: i32 = 0x3272;
const EGL_DMA_BUF_PLANE0_OFFSET_EXT: i32 = 0x3273;
const EGL_DMA_BUF_PLANE0_PITCH_EXT: i32 = 0x3274;
const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: i32 = 0x3443;
const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: i32 = 0x3444;

type PfnEglCreateImageKhr =
    unsafe extern "system" fn(*mut c_void, *mut c_void, u32, *mut c_void, *const i32) -> *mut c_void;
type PfnEglDestroyImageKhr = unsafe extern "system" fn(*mut c_void, *mut c_void) -> u32;
type PfnGlEglImageTargetTexture2dOes = unsafe extern "system" fn(u32, *mut c_void);

#[derive(Debug, Clone, Error)]
pub enum ImportError {
    #[error("EGL context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("missing EGL capability: {0}")]
    CapabilityMissing(&'static str),

    #[error("DMA-BUF import failed: {0}")]
    ImportFailed(String),

    #[error("offscreen target incomplete (status 0x{0:04x})")]
    IncompleteTarget(u32),

    #[error("GPU worker unavailable")]
    WorkerGone,
}

/// One DMA-BUF readback request
#[derive(Debug, Clone, Copy)]
pub struct ImportRequest {
    /// Raw descriptor; the owner must outlive the import call
    pub fd: i32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: u32,
    pub modifier: u64,
}

enum Command {
    Import(ImportRequest, mpsc::Sender<Result<Vec<u8>, ImportError>>),
    Shutdown,
}

/// Handle to the dedicated GPU thread
pub struct GpuWorker {
    tx: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl GpuWorker {
    /// Spawn the worker. The EGL context itself is created on the worker
    /// thread when the first import arrives.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let thread = std::thread::Builder::new()
            .name("vmdisplay-gpu".into())
            .spawn(move || worker_loop(rx))
            .expect("failed to spawn GPU worker thread");
        Self {
            tx,
            thread: Some(thread),
        }
    }

    /// Import the DMA-BUF and read it back as an RGB plane. Blocks the
    /// caller for the duration of one readback.
    pub fn import(&self, req: ImportRequest) -> Result<Vec<u8>, ImportError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Command::Import(req, reply_tx))
            .map_err(|_| ImportError::WorkerGone)?;
        reply_rx.recv().map_err(|_| ImportError::WorkerGone)?
    }
}

impl Drop for GpuWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(rx: mpsc::Receiver<Command>) {
    // Lazily initialized; a failed init is cached so repeated scanouts
    // don't retry (and re-log) on every frame.
    let mut renderer: Option<Result<EglRenderer, ImportError>> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Shutdown => break,
            Command::Import(req, reply) => {
                let state = renderer.get_or_insert_with(|| {
                    EglRenderer::new().inspect_err(|e| warn!("EGL init failed: {e}"))
                });
                let result = match state {
                    Ok(r) => r.read_dmabuf(&req),
                    Err(e) => Err(e.clone()),
                };
                let _ = reply.send(result);
            }
        }
    }
    debug!("GPU worker shutting down");
}

/// Headless EGL context plus the extension entry points the import needs.
/// Lives entirely on the worker thread.
struct EglRenderer {
    egl: Egl,
    display: khronos_egl::Display,
    context: khronos_egl::Context,
    surface: Option<khronos_egl::Surface>,
    extensions: String,
    create_image: PfnEglCreateImageKhr,
    destroy_image: PfnEglDestroyImageKhr,
    image_target_texture: PfnGlEglImageTargetTexture2dOes,
}

impl EglRenderer {
    fn new() -> Result<Self, ImportError> {
        let ctx_err = |msg: String| ImportError::ContextUnavailable(msg);

        // Prefer surfaceless EGL in headless environments
        if std::env::var_os("EGL_PLATFORM").is_none() {
            std::env::set_var("EGL_PLATFORM", "surfaceless");
        }

        // SAFETY: loads libEGL.so.1 / libEGL.so; the instance keeps the
        // library alive for its own lifetime.
        let egl = unsafe { DynamicInstance::<khronos_egl::EGL1_4>::load_required() }
            .map_err(|e| ctx_err(format!("failed to load libEGL: {e}")))?;

        // SAFETY: DEFAULT_DISPLAY is a valid native display token for EGL.
        let display = unsafe { egl.get_display(khronos_egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| ctx_err("no default EGL display".into()))?;
        let (major, minor) = egl
            .initialize(display)
            .map_err(|e| ctx_err(format!("eglInitialize failed: {e}")))?;
        info!("EGL initialized: version {major}.{minor}");

        egl.bind_api(khronos_egl::OPENGL_API)
            .map_err(|e| ctx_err(format!("failed to bind OpenGL API: {e}")))?;

        let config_attribs = [
            khronos_egl::RED_SIZE,
            8,
            khronos_egl::GREEN_SIZE,
            8,
            khronos_egl::BLUE_SIZE,
            8,
            khronos_egl::ALPHA_SIZE,
            8,
            khronos_egl::SURFACE_TYPE,
            khronos_egl::PBUFFER_BIT,
            khronos_egl::RENDERABLE_TYPE,
            khronos_egl::OPENGL_BIT,
            khronos_egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attribs)
            .map_err(|e| ctx_err(format!("eglChooseConfig failed: {e}")))?
            .ok_or_else(|| ctx_err("no suitable EGL config".into()))?;

        let context = egl
            .create_context(display, config, None, &[khronos_egl::NONE])
            .map_err(|e| ctx_err(format!("eglCreateContext failed: {e}")))?;

        let extensions = egl
            .query_string(Some(display), khronos_egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Surfaceless if the driver supports it, otherwise a 1x1 pbuffer
        let surface = if extensions.contains("EGL_KHR_surfaceless_context") {
            egl.make_current(display, None, None, Some(context))
                .map_err(|e| ctx_err(format!("eglMakeCurrent (surfaceless) failed: {e}")))?;
            debug!("EGL context current (surfaceless)");
            None
        } else {
            let pbuffer_attribs = [
                khronos_egl::WIDTH,
                1,
                khronos_egl::HEIGHT,
                1,
                khronos_egl::NONE,
            ];
            let surface = egl
                .create_pbuffer_surface(display, config, &pbuffer_attribs)
                .map_err(|e| ctx_err(format!("pbuffer creation failed: {e}")))?;
            egl.make_current(display, Some(surface), Some(surface), Some(context))
                .map_err(|e| ctx_err(format!("eglMakeCurrent (pbuffer) failed: {e}")))?;
            debug!("EGL context current (1x1 pbuffer)");
            Some(surface)
        };

        gl::load_with(|symbol| match egl.get_proc_address(symbol) {
            Some(f) => f as *const c_void,
            None => ptr::null(),
        });

        let create_image = egl
            .get_proc_address("eglCreateImageKHR")
            .ok_or(ImportError::CapabilityMissing("eglCreateImageKHR"))?;
        let destroy_image = egl
            .get_proc_address("eglDestroyImageKHR")
            .ok_or(ImportError::CapabilityMissing("eglDestroyImageKHR"))?;
        let image_target_texture = egl
            .get_proc_address("glEGLImageTargetTexture2DOES")
            .ok_or(ImportError::CapabilityMissing("glEGLImageTargetTexture2DOES"))?;

        // SAFETY: the symbols above resolve to the documented extension
        // signatures; eglGetProcAddress returned non-null for each.
        let (create_image, destroy_image, image_target_texture) = unsafe {
            (
                std::mem::transmute::<extern "system" fn(), PfnEglCreateImageKhr>(create_image),
                std::mem::transmute::<extern "system" fn(), PfnEglDestroyImageKhr>(destroy_image),
                std::mem::transmute::<extern "system" fn(), PfnGlEglImageTargetTexture2dOes>(
                    image_target_texture,
                ),
            )
        };

        info!("EGL renderer ready (DMA-BUF import path)");

        Ok(Self {
            egl,
            display,
            context,
            surface,
            extensions,
            create_image,
            destroy_image,
            image_target_texture,
        })
    }

    fn read_dmabuf(&self, req: &ImportRequest) -> Result<Vec<u8>, ImportError> {
        if !self.extensions.contains("EGL_EXT_image_dma_buf_import") {
            return Err(ImportError::CapabilityMissing("EGL_EXT_image_dma_buf_import"));
        }
        if req.modifier != 0 && !self.extensions.contains("EGL_EXT_image_dma_buf_import_modifiers")
        {
            return Err(ImportError::CapabilityMissing(
                "EGL_EXT_image_dma_buf_import_modifiers",
            ));
        }

        let mut attrs: Vec<i32> = vec![
            khronos_egl::WIDTH,
            req.width as i32,
            khronos_egl::HEIGHT,
            req.height as i32,
            EGL_LINUX_DRM_FOURCC_EXT,
            req.fourcc as i32,
            EGL_DMA_BUF_PLANE0_FD_EXT,
            req.fd,
            EGL_DMA_BUF_PLANE0_OFFSET_EXT,
            0,
            EGL_DMA_BUF_PLANE0_PITCH_EXT,
            req.stride as i32,
        ];
        if req.modifier != 0 {
            attrs.extend_from_slice(&[
                EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
                (req.modifier & 0xffff_ffff) as i32,
                EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
                (req.modifier >> 32) as i32,
            ]);
        }
        attrs.push(khronos_egl::NONE);

        // SAFETY: attrs is a NONE-terminated list per the extension spec and
        // the fd is kept open by the caller for the duration of this call.
        let image = unsafe {
            (self.create_image)(
                self.display.as_ptr(),
                ptr::null_mut(), // EGL_NO_CONTEXT, required for DMA-BUF targets
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                attrs.as_ptr(),
            )
        };
        if image.is_null() {
            return Err(ImportError::ImportFailed(format!(
                "eglCreateImageKHR rejected fourcc 0x{:08x} modifier 0x{:x}",
                req.fourcc, req.modifier
            )));
        }
        let image = ImageGuard {
            display: self.display.as_ptr(),
            image,
            destroy: self.destroy_image,
        };

        // Bind the image as a 2D texture and attach it to an offscreen target
        let texture = TextureGuard::new();
        // SAFETY: GL calls on the worker thread with the context current.
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture.id);
            (self.image_target_texture)(gl::TEXTURE_2D, image.image);
        }

        let fbo = FramebufferGuard::new();
        let mut rgb = vec![0u8; req.width as usize * req.height as usize * 3];
        // SAFETY: texture and fbo are live GL names; rgb is sized for the
        // RGB/UNSIGNED_BYTE readback with pack alignment 1.
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, fbo.id);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                texture.id,
                0,
            );

            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            if status != gl::FRAMEBUFFER_COMPLETE {
                gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
                return Err(ImportError::IncompleteTarget(status));
            }

            gl::PixelStorei(gl::PACK_ALIGNMENT, 1);
            gl::ReadBuffer(gl::COLOR_ATTACHMENT0);
            gl::ReadPixels(
                0,
                0,
                req.width as i32,
                req.height as i32,
                gl::RGB,
                gl::UNSIGNED_BYTE,
                rgb.as_mut_ptr() as *mut c_void,
            );
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
        }

        Ok(rgb)
    }
}

impl Drop for EglRenderer {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        if let Some(surface) = self.surface.take() {
            let _ = self.egl.destroy_surface(self.display, surface);
        }
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
        debug!("EGL renderer released");
    }
}

struct TextureGuard {
    id: u32,
}

impl TextureGuard {
    fn new() -> Self {
        let mut id = 0;
        // SAFETY: plain GL name generation with the context current.
        unsafe { gl::GenTextures(1, &mut id) };
        Self { id }
    }
}

impl Drop for TextureGuard {
    fn drop(&mut self) {
        // SAFETY: id came from GenTextures and is deleted once.
        unsafe { gl::DeleteTextures(1, &self.id) };
    }
}

struct FramebufferGuard {
    id: u32,
}

impl FramebufferGuard {
    fn new() -> Self {
        let mut id = 0;
        // SAFETY: plain GL name generation with the context current.
        unsafe { gl::GenFramebuffers(1, &mut id) };
        Self { id }
    }
}

impl Drop for FramebufferGuard {
    fn drop(&mut self) {
        // SAFETY: id came from GenFramebuffers and is deleted once.
        unsafe { gl::DeleteFramebuffers(1, &self.id) };
    }
}

struct ImageGuard {
    display: *mut c_void,
    image: *mut c_void,
    destroy: PfnEglDestroyImageKhr,
}

impl Drop for ImageGuard {
    fn drop(&mut self) {
        // SAFETY: image came from a successful eglCreateImageKHR on display.
        unsafe { (self.destroy)(self.display, self.image) };
    }
}
