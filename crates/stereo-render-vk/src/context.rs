// SPDX-License-Identifier: CEPL-1.0
//! Runtime and device bring-up. Everything else in this crate borrows the
//! [`Context`], so it is the last thing torn down.
use std::ffi::{c_char, c_void, CString};

use anyhow::{anyhow, Context as _, Result};
use ash::vk::{self, Handle};
use ash::{Entry, Instance};
use openxr as xr;
use stereo_core::{report, ErrorKind};
use tracing::info;

pub const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;

/// Multiview needs 1.1.
const MIN_VULKAN_VERSION: u32 = vk::API_VERSION_1_1;

pub struct Context {
    xr_instance: xr::Instance,
    system: xr::SystemId,

    _entry: Entry,
    instance: Instance,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,

    memory_properties: vk::PhysicalDeviceMemoryProperties,
    min_uniform_alignment: u64,
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn parse_extension_list(list: &str) -> Result<Vec<CString>> {
    list.split_whitespace()
        .map(|name| CString::new(name).context("extension name"))
        .collect()
}

fn find_graphics_queue_family(instance: &Instance, phys: vk::PhysicalDevice) -> Result<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
    families
        .iter()
        .position(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
        .ok_or_else(|| report(ErrorKind::NoSuitableDevice, Some("no graphics queue family")))
}

fn create_xr_instance(app_name: &str) -> Result<xr::Instance> {
    let entry = unsafe { xr::Entry::load() }
        .map_err(|e| report(ErrorKind::XrRuntime, Some(&format!("OpenXR loader: {e}"))))?;

    let available = entry
        .enumerate_extensions()
        .map_err(|e| anyhow!("xrEnumerateInstanceExtensionProperties: {e}"))?;
    if !available.khr_vulkan_enable {
        return Err(report(
            ErrorKind::XrRuntime,
            Some("runtime lacks XR_KHR_vulkan_enable"),
        ));
    }
    let mut exts = xr::ExtensionSet::default();
    exts.khr_vulkan_enable = true;

    let app_info = xr::ApplicationInfo {
        application_name: app_name,
        application_version: 1,
        engine_name: "stereo",
        engine_version: 1,
        api_version: xr::Version::new(1, 0, 0),
    };
    let instance = entry
        .create_instance(&app_info, &exts, &[])
        .map_err(|e| report(ErrorKind::XrRuntime, Some(&format!("xrCreateInstance: {e}"))))?;

    if let Ok(props) = instance.properties() {
        info!(
            "xr: runtime {} v{}",
            props.runtime_name, props.runtime_version
        );
    }
    Ok(instance)
}

fn create_vk_instance(
    entry: &Entry,
    xr_instance: &xr::Instance,
    system: xr::SystemId,
    app_name: &CString,
) -> Result<Instance> {
    let reqs = xr_instance
        .graphics_requirements::<xr::Vulkan>(system)
        .map_err(|e| anyhow!("xrGetVulkanGraphicsRequirementsKHR: {e}"))?;
    let runtime_min = vk::make_api_version(
        0,
        reqs.min_api_version_supported.major() as u32,
        reqs.min_api_version_supported.minor() as u32,
        reqs.min_api_version_supported.patch(),
    );
    let api_version = runtime_min.max(MIN_VULKAN_VERSION);

    let ext_names = xr_instance
        .vulkan_legacy_instance_extensions(system)
        .map_err(|e| anyhow!("xrGetVulkanInstanceExtensionsKHR: {e}"))?;
    let exts = parse_extension_list(&ext_names)?;
    let ext_ptrs: Vec<*const c_char> = exts.iter().map(|s| s.as_ptr()).collect();

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: 0,
        p_engine_name: app_name.as_ptr(),
        engine_version: 0,
        api_version,
        ..Default::default()
    };
    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_ptrs.len() as u32,
        pp_enabled_extension_names: ext_ptrs.as_ptr(),
        ..Default::default()
    };
    unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| report(ErrorKind::Vulkan, Some(&format!("vkCreateInstance: {e}"))))
}

fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
    xr_instance: &xr::Instance,
    system: xr::SystemId,
) -> Result<ash::Device> {
    let ext_names = xr_instance
        .vulkan_legacy_device_extensions(system)
        .map_err(|e| anyhow!("xrGetVulkanDeviceExtensionsKHR: {e}"))?;
    let exts = parse_extension_list(&ext_names)?;
    let ext_ptrs: Vec<*const c_char> = exts.iter().map(|s| s.as_ptr()).collect();

    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let multiview = vk::PhysicalDeviceMultiviewFeatures {
        s_type: vk::StructureType::PHYSICAL_DEVICE_MULTIVIEW_FEATURES,
        multiview: vk::TRUE,
        ..Default::default()
    };

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: &multiview as *const _ as *const c_void,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: ext_ptrs.len() as u32,
        pp_enabled_extension_names: ext_ptrs.as_ptr(),
        ..Default::default()
    };
    unsafe { instance.create_device(phys, &dinfo, None) }
        .map_err(|e| report(ErrorKind::Vulkan, Some(&format!("vkCreateDevice: {e}"))))
}

impl Context {
    pub fn new(app_name: &str) -> Result<Self> {
        let xr_instance = create_xr_instance(app_name)?;
        let system = xr_instance
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .map_err(|e| report(ErrorKind::XrRuntime, Some(&format!("no headset: {e}"))))?;
        if let Ok(props) = xr_instance.system_properties(system) {
            info!(
                "xr: headset {} (vendor {}), orientation={} position={}",
                props.system_name,
                props.vendor_id,
                props.tracking_properties.orientation_tracking,
                props.tracking_properties.position_tracking
            );
        }

        let entry = Entry::linked();
        let c_name = CString::new(app_name).context("application name")?;
        let instance = create_vk_instance(&entry, &xr_instance, system, &c_name)?;

        // The runtime dictates which GPU drives the headset.
        let phys_raw = unsafe {
            xr_instance.vulkan_graphics_device(system, instance.handle().as_raw() as *const _)
        };
        let phys = match phys_raw {
            Ok(p) => vk::PhysicalDevice::from_raw(p as u64),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(report(
                    ErrorKind::NoSuitableDevice,
                    Some(&format!("xrGetVulkanGraphicsDeviceKHR: {e}")),
                ));
            }
        };

        let device = find_graphics_queue_family(&instance, phys).and_then(|family| {
            create_device(&instance, phys, family, &xr_instance, system).map(|d| (d, family))
        });
        let (device, queue_family) = match device {
            Ok(pair) => pair,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(phys) };
        let props = unsafe { instance.get_physical_device_properties(phys) };
        let min_uniform_alignment = props.limits.min_uniform_buffer_offset_alignment;

        info!(
            "vk: device ready (queue family {}, ubo alignment {})",
            queue_family, min_uniform_alignment
        );

        Ok(Self {
            xr_instance,
            system,
            _entry: entry,
            instance,
            phys,
            device,
            queue_family,
            queue,
            memory_properties,
            min_uniform_alignment,
        })
    }

    pub fn xr_instance(&self) -> &xr::Instance {
        &self.xr_instance
    }

    pub fn system(&self) -> xr::SystemId {
        self.system
    }

    pub fn vk_instance(&self) -> &Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// `minUniformBufferOffsetAlignment` of the device, always a power of two.
    pub fn min_uniform_alignment(&self) -> u64 {
        self.min_uniform_alignment
    }

    /// Blocks until the device is idle, so resources can be freed.
    pub fn sync(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle")
    }
}
