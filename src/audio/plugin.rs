// Loadable stereo effects. A plugin library exports steprender_plugin_descriptor,
// which returns a pointer to a static PluginDescriptor. Host side, every plugin
// is just another Effect.

use std::ffi::{CStr, c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::{Library, Symbol};
use thiserror::Error;

use super::effect::Effect;
use super::frame::StereoFrame;

pub const PLUGIN_ABI_VERSION: u32 = 1;
pub const DESCRIPTOR_SYMBOL: &[u8] = b"steprender_plugin_descriptor";

// frames handed to a plugin per call; larger host blocks are split
const PLUGIN_BLOCK: usize = 1024;

pub type DescriptorFn = unsafe extern "C" fn() -> *const PluginDescriptor;

#[repr(C)]
pub struct PluginParameter {
    pub id: u32,
    pub name: *const c_char,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

#[repr(C)]
pub struct PluginDescriptor {
    pub abi_version: u32,
    pub identifier: *const c_char,
    pub name: *const c_char,
    pub parameters: *const PluginParameter,
    pub parameter_count: u32,
    pub create: unsafe extern "C" fn(sample_rate: f32) -> *mut c_void,
    pub destroy: unsafe extern "C" fn(handle: *mut c_void),
    pub set_parameter: unsafe extern "C" fn(handle: *mut c_void, id: u32, value: f32),
    pub process: unsafe extern "C" fn(handle: *mut c_void, left: *mut f32, right: *mut f32, frames: u32),
    pub reset: unsafe extern "C" fn(handle: *mut c_void),
}

// Descriptors and their parameter tables are immutable statics in the plugin.
unsafe impl Sync for PluginDescriptor {}
unsafe impl Sync for PluginParameter {}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to load plugin library {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("{path} does not export a plugin descriptor: {source}")]
    MissingSymbol {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin descriptor is null")]
    NullDescriptor,

    #[error("plugin ABI version {found} is not supported (expected {})", PLUGIN_ABI_VERSION)]
    AbiMismatch { found: u32 },

    #[error("invalid plugin descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("plugin {identifier} failed to create an instance")]
    CreateFailed { identifier: String },

    #[error("plugin {identifier} has no parameter {id}")]
    UnknownParameter { identifier: String, id: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterInfo {
    pub id: u32,
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PluginInfo {
    pub identifier: String,
    pub name: String,
    pub parameters: Vec<ParameterInfo>,
}

impl PluginInfo {
    pub fn parameter(&self, id: u32) -> Option<&ParameterInfo> {
        self.parameters.iter().find(|p| p.id == id)
    }
}

// The entry points, copied out of the descriptor.
#[derive(Clone, Copy)]
struct EntryPoints {
    create: unsafe extern "C" fn(f32) -> *mut c_void,
    destroy: unsafe extern "C" fn(*mut c_void),
    set_parameter: unsafe extern "C" fn(*mut c_void, u32, f32),
    process: unsafe extern "C" fn(*mut c_void, *mut f32, *mut f32, u32),
    reset: unsafe extern "C" fn(*mut c_void),
}

unsafe fn read_str(ptr: *const c_char, what: &'static str) -> Result<String, PluginError> {
    if ptr.is_null() {
        return Err(PluginError::InvalidDescriptor(what));
    }
    Ok(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// # Safety
/// `desc` must point to a descriptor whose strings are NUL-terminated and
/// whose parameter table holds `parameter_count` entries.
unsafe fn read_descriptor(desc: *const PluginDescriptor) -> Result<(PluginInfo, EntryPoints), PluginError> {
    let desc = unsafe { desc.as_ref() }.ok_or(PluginError::NullDescriptor)?;
    if desc.abi_version != PLUGIN_ABI_VERSION {
        return Err(PluginError::AbiMismatch { found: desc.abi_version });
    }
    let identifier = unsafe { read_str(desc.identifier, "missing identifier") }?;
    let name = unsafe { read_str(desc.name, "missing display name") }?;

    let count = desc.parameter_count as usize;
    let table: &[PluginParameter] = if count == 0 {
        &[]
    } else if desc.parameters.is_null() {
        return Err(PluginError::InvalidDescriptor("parameter table is null"));
    } else {
        unsafe { std::slice::from_raw_parts(desc.parameters, count) }
    };
    let mut parameters = Vec::with_capacity(count);
    for p in table {
        if !(p.min <= p.max) {
            return Err(PluginError::InvalidDescriptor("parameter min exceeds max"));
        }
        parameters.push(ParameterInfo {
            id: p.id,
            name: unsafe { read_str(p.name, "missing parameter name") }?,
            min: p.min,
            max: p.max,
            default: p.default.clamp(p.min, p.max),
        });
    }

    let entry = EntryPoints {
        create: desc.create,
        destroy: desc.destroy,
        set_parameter: desc.set_parameter,
        process: desc.process,
        reset: desc.reset,
    };
    Ok((PluginInfo { identifier, name, parameters }, entry))
}

// Instances keep the library mapped.
pub struct PluginLibrary {
    path: PathBuf,
    info: Arc<PluginInfo>,
    entry: EntryPoints,
    library: Arc<Library>,
}

impl PluginLibrary {
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        // Loading runs the library's initialisers; plugins are user-chosen code.
        let library = unsafe { Library::new(path) }.map_err(|source| PluginError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptor = {
            let get: Symbol<DescriptorFn> = unsafe { library.get(DESCRIPTOR_SYMBOL) }.map_err(|source| {
                PluginError::MissingSymbol { path: path.to_path_buf(), source }
            })?;
            unsafe { get() }
        };
        let (info, entry) = unsafe { read_descriptor(descriptor) }?;
        log::info!(
            "loaded plugin {} ({}) from {} with {} parameters",
            info.name,
            info.identifier,
            path.display(),
            info.parameters.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            info: Arc::new(info),
            entry,
            library: Arc::new(library),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn instantiate(&self, sample_rate: f32) -> Result<PluginEffect, PluginError> {
        let mut fx = PluginEffect::create(self.info.clone(), self.entry, sample_rate)?;
        fx._library = Some(self.library.clone());
        Ok(fx)
    }
}

// failures are logged and skipped
pub fn load_all(paths: &[PathBuf]) -> Vec<PluginLibrary> {
    paths
        .iter()
        .filter_map(|p| match PluginLibrary::load(p) {
            Ok(lib) => Some(lib),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        })
        .collect()
}

pub struct PluginEffect {
    info: Arc<PluginInfo>,
    entry: EntryPoints,
    handle: NonNull<c_void>,
    left: Vec<f32>,
    right: Vec<f32>,
    _library: Option<Arc<Library>>, // dropped after the handle is destroyed
}

// The handle is only ever used by whichever thread owns the effect.
unsafe impl Send for PluginEffect {}

impl PluginEffect {
    /// For effects compiled into the host.
    ///
    /// # Safety
    /// `desc` must satisfy the plugin ABI for as long as the returned effect
    /// lives.
    pub unsafe fn from_descriptor(desc: *const PluginDescriptor, sample_rate: f32) -> Result<Self, PluginError> {
        let (info, entry) = unsafe { read_descriptor(desc) }?;
        Self::create(Arc::new(info), entry, sample_rate)
    }

    fn create(info: Arc<PluginInfo>, entry: EntryPoints, sample_rate: f32) -> Result<Self, PluginError> {
        let raw = unsafe { (entry.create)(sample_rate) };
        let handle = NonNull::new(raw).ok_or_else(|| PluginError::CreateFailed {
            identifier: info.identifier.clone(),
        })?;
        let fx = Self {
            info,
            entry,
            handle,
            left: vec![0.0; PLUGIN_BLOCK],
            right: vec![0.0; PLUGIN_BLOCK],
            _library: None,
        };
        for p in &fx.info.parameters {
            unsafe { (fx.entry.set_parameter)(fx.handle.as_ptr(), p.id, p.default) };
        }
        Ok(fx)
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    // returns the clamped value actually sent
    pub fn set_parameter(&mut self, id: u32, value: f32) -> Result<f32, PluginError> {
        let param = self.info.parameter(id).ok_or_else(|| PluginError::UnknownParameter {
            identifier: self.info.identifier.clone(),
            id,
        })?;
        let value = if value.is_nan() { param.default } else { value.clamp(param.min, param.max) };
        unsafe { (self.entry.set_parameter)(self.handle.as_ptr(), id, value) };
        Ok(value)
    }
}

impl Effect for PluginEffect {
    fn process(&mut self, buf: &mut [StereoFrame]) {
        for chunk in buf.chunks_mut(PLUGIN_BLOCK) {
            let n = chunk.len();
            for (i, f) in chunk.iter().enumerate() {
                self.left[i] = f.left;
                self.right[i] = f.right;
            }
            unsafe {
                (self.entry.process)(
                    self.handle.as_ptr(),
                    self.left.as_mut_ptr(),
                    self.right.as_mut_ptr(),
                    n as u32,
                )
            };
            for (i, f) in chunk.iter_mut().enumerate() {
                *f = StereoFrame::new(self.left[i], self.right[i]);
            }
        }
    }

    fn reset(&mut self) {
        unsafe { (self.entry.reset)(self.handle.as_ptr()) };
    }
}

impl Drop for PluginEffect {
    fn drop(&mut self) {
        unsafe { (self.entry.destroy)(self.handle.as_ptr()) };
    }
}
