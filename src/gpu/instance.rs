//! Vulkan instance bootstrap.
//!
//! Validation output is not printed from a free-standing callback. Whoever
//! creates the instance hands over a [`DiagnosticSink`]; the instance owns it
//! for as long as the debug messenger exists and passes it to the driver as
//! the messenger's user data.

use std::ffi::{c_char, c_void, CStr};

use ash::vk;
use log::{debug, error, info, trace, warn};

use crate::common::FatalKind;

pub const APPLICATION_NAME: &CStr = c"transfer_bench";
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Severity of a driver or layer diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticSeverity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<vk::DebugUtilsMessageSeverityFlagsEXT> for DiagnosticSeverity {
    fn from(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            DiagnosticSeverity::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            DiagnosticSeverity::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            DiagnosticSeverity::Info
        } else {
            DiagnosticSeverity::Verbose
        }
    }
}

/// Receives diagnostics from the validation layers.
pub trait DiagnosticSink: Send + Sync {
    fn diagnostic(&self, severity: DiagnosticSeverity, message: &str);
}

/// Forwards diagnostics into the `log` facade.
#[derive(Default, Debug)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn diagnostic(&self, severity: DiagnosticSeverity, message: &str) {
        match severity {
            DiagnosticSeverity::Error => error!(target: "vulkan", "{}", message),
            DiagnosticSeverity::Warning => warn!(target: "vulkan", "{}", message),
            DiagnosticSeverity::Info => info!(target: "vulkan", "{}", message),
            DiagnosticSeverity::Verbose => trace!(target: "vulkan", "{}", message),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InstanceError {
    #[error("Could not load the Vulkan library: {0}")]
    Load(#[from] ash::LoadingError),
    #[error("Could not enumerate instance layers: {0}")]
    EnumerateLayers(vk::Result),
    #[error("Required layer {0} is not installed")]
    MissingLayer(String),
    #[error("Could not create instance: {0}")]
    CreateInstance(vk::Result),
    #[error("Could not create debug utils messenger: {0}")]
    CreateMessenger(vk::Result),
}

impl InstanceError {
    pub fn kind(&self) -> FatalKind {
        match self {
            InstanceError::Load(_) | InstanceError::MissingLayer(_) => FatalKind::Configuration,
            InstanceError::EnumerateLayers(result)
            | InstanceError::CreateInstance(result)
            | InstanceError::CreateMessenger(result) => FatalKind::from_vk(*result),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstanceOptions {
    /// Enable `VK_LAYER_KHRONOS_validation` and route its output to the sink.
    pub validation: bool,
    pub api_version: u32,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        InstanceOptions {
            validation: false,
            api_version: vk::API_VERSION_1_3,
        }
    }
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Owns the loader entry, the instance and, with validation on, the debug
/// messenger and the sink it reports to.
pub struct VulkanInstance {
    // Field order matters only for the drop glue after `Drop::drop` has run;
    // the handles themselves are destroyed explicitly.
    messenger: Option<DebugMessenger>,
    instance: ash::Instance,
    _entry: ash::Entry,
    // Double-boxed so the messenger's user data can be a thin pointer.
    _sink: Option<Box<Box<dyn DiagnosticSink>>>,
}

impl std::fmt::Debug for VulkanInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanInstance")
            .field("handle", &self.instance.handle())
            .field("validation", &self.messenger.is_some())
            .finish_non_exhaustive()
    }
}

unsafe extern "system" fn debug_messenger_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: user data is the `Box<dyn DiagnosticSink>` owned by the
    // `VulkanInstance`, which outlives the messenger.
    let sink = unsafe { &*(p_user_data as *const Box<dyn DiagnosticSink>) };
    let p_message = unsafe { (*p_callback_data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();
    sink.diagnostic(message_severity.into(), &message);
    vk::FALSE
}

fn messenger_create_info<'a>(sink: *mut c_void) -> vk::DebugUtilsMessengerCreateInfoEXT<'a> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_messenger_callback))
        .user_data(sink)
}

fn check_layer(entry: &ash::Entry, layer: &CStr) -> Result<(), InstanceError> {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .map_err(InstanceError::EnumerateLayers)?;
    let found = layers
        .iter()
        .any(|properties| unsafe { CStr::from_ptr(properties.layer_name.as_ptr()) } == layer);
    if found {
        Ok(())
    } else {
        Err(InstanceError::MissingLayer(layer.to_string_lossy().into_owned()))
    }
}

impl VulkanInstance {
    /// Loads Vulkan and creates an instance. `sink` is only used when
    /// validation is enabled.
    pub fn new(
        options: &InstanceOptions,
        sink: Box<dyn DiagnosticSink>,
    ) -> Result<Self, InstanceError> {
        let entry = unsafe { ash::Entry::load()? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(APPLICATION_NAME)
            .application_version(vk::make_api_version(0, 0, 0, 1))
            .api_version(options.api_version);

        if !options.validation {
            let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
            let instance = unsafe { entry.create_instance(&create_info, None) }
                .map_err(InstanceError::CreateInstance)?;
            info!("Created Vulkan instance without validation");
            return Ok(VulkanInstance {
                messenger: None,
                instance,
                _entry: entry,
                _sink: None,
            });
        }

        check_layer(&entry, VALIDATION_LAYER)?;

        let sink = Box::new(sink);
        let sink_ptr = &*sink as *const Box<dyn DiagnosticSink> as *mut c_void;

        let layers: [*const c_char; 1] = [VALIDATION_LAYER.as_ptr()];
        let extensions: [*const c_char; 1] = [ash::ext::debug_utils::NAME.as_ptr()];
        // Chained into instance creation too, so create/destroy diagnostics
        // are not lost.
        let mut instance_messenger_info = messenger_create_info(sink_ptr);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions)
            .push_next(&mut instance_messenger_info);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(InstanceError::CreateInstance)?;

        let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
        let messenger_info = messenger_create_info(sink_ptr);
        let created = unsafe { loader.create_debug_utils_messenger(&messenger_info, None) };
        let messenger = match created {
            Ok(messenger) => messenger,
            Err(result) => {
                unsafe { instance.destroy_instance(None) };
                return Err(InstanceError::CreateMessenger(result));
            }
        };
        info!("Created Vulkan instance with {}", VALIDATION_LAYER.to_string_lossy());

        Ok(VulkanInstance {
            messenger: Some(DebugMessenger { loader, messenger }),
            instance,
            _entry: entry,
            _sink: Some(sink),
        })
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        debug!("Dropping instance {:?}", self.instance.handle());
        //SAFETY: Every device created from this instance holds an `Arc` to
        //it, so they are all gone by now.
        unsafe {
            if let Some(debug) = self.messenger.take() {
                debug.loader.destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
