// Native surface creation
//
// The window/view layer hands us an opaque (display, window) handle pair.
// ash-window turns it into the instance extensions we must enable and into
// a VkSurfaceKHR. A headless surface (VK_EXT_headless_surface) stands in
// for a window when presenting offscreen.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_void, CStr};
use std::ptr;

use crate::error::HarnessError;

/// Opaque native surface handle supplied by the host window system.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceHandle {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// A created surface together with the loader that owns its entry points.
#[derive(Clone)]
pub struct PresentSurface {
    pub loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl PresentSurface {
    pub fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Instance extensions required to present to a window on `display`.
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let names = match ash_window::enumerate_required_extensions(display) {
        Ok(names) => names,
        Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT) => {
            return Err(HarnessError::UnsupportedPlatform("display handle").into())
        }
        Err(e) => return Err(e).context("Failed to enumerate surface extensions"),
    };

    // ash-window hands out static, nul-terminated extension names
    let mut extensions: Vec<&'static CStr> = names
        .iter()
        .map(|&name| unsafe { CStr::from_ptr(name) })
        .collect();

    if matches!(display, RawDisplayHandle::AppKit(_) | RawDisplayHandle::UiKit(_)) {
        // MoltenVK is a portability implementation
        extensions.push(vk::KhrPortabilityEnumerationFn::name());
    }

    Ok(extensions)
}

/// Instance extensions for an offscreen headless surface.
pub fn headless_instance_extensions() -> Vec<&'static CStr> {
    vec![khr::Surface::name(), vk::ExtHeadlessSurfaceFn::name()]
}

/// Create a surface for `handle`.
///
/// # Safety
/// The native handles must stay valid until the returned surface is
/// destroyed.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    handle: &SurfaceHandle,
) -> Result<PresentSurface> {
    let surface = ash_window::create_surface(entry, instance, handle.display, handle.window, None)
        .context("Failed to create window surface")?;

    Ok(PresentSurface {
        loader: khr::Surface::new(entry, instance),
        handle: surface,
    })
}

/// Create a VK_EXT_headless_surface. The instance must have been created
/// with [`headless_instance_extensions`].
pub unsafe fn create_headless_surface(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<PresentSurface> {
    let headless_fn = vk::ExtHeadlessSurfaceFn::load(|name| {
        entry
            .get_instance_proc_addr(instance.handle(), name.as_ptr())
            .map_or(ptr::null(), |f| f as *const c_void)
    });

    let create_info = vk::HeadlessSurfaceCreateInfoEXT::builder();
    let mut surface = vk::SurfaceKHR::null();
    (headless_fn.create_headless_surface_ext)(
        instance.handle(),
        &*create_info,
        ptr::null(),
        &mut surface,
    )
    .result()
    .context("vkCreateHeadlessSurfaceEXT failed")?;

    Ok(PresentSurface {
        loader: khr::Surface::new(entry, instance),
        handle: surface,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::extensions::ext;
    use raw_window_handle::{
        AppKitDisplayHandle, WaylandDisplayHandle, WebDisplayHandle, WindowsDisplayHandle,
        XlibDisplayHandle,
    };

    #[test]
    fn xlib_needs_surface_and_xlib_surface() {
        let display = RawDisplayHandle::Xlib(XlibDisplayHandle::empty());
        let extensions = required_instance_extensions(display).unwrap();
        assert_eq!(
            extensions,
            vec![khr::Surface::name(), khr::XlibSurface::name()]
        );
    }

    #[test]
    fn wayland_and_windows_pick_their_platform_extension() {
        let wayland = RawDisplayHandle::Wayland(WaylandDisplayHandle::empty());
        assert!(required_instance_extensions(wayland)
            .unwrap()
            .contains(&khr::WaylandSurface::name()));

        let windows = RawDisplayHandle::Windows(WindowsDisplayHandle::empty());
        assert!(required_instance_extensions(windows)
            .unwrap()
            .contains(&khr::Win32Surface::name()));
    }

    #[test]
    fn appkit_uses_metal_surface_and_portability_enumeration() {
        let display = RawDisplayHandle::AppKit(AppKitDisplayHandle::empty());
        let extensions = required_instance_extensions(display).unwrap();
        assert!(extensions.contains(&ext::MetalSurface::name()));
        assert!(extensions.contains(&vk::KhrPortabilityEnumerationFn::name()));
    }

    #[test]
    fn unknown_window_system_is_unsupported() {
        let display = RawDisplayHandle::Web(WebDisplayHandle::empty());
        let err = required_instance_extensions(display).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn headless_surface_extensions() {
        let extensions = headless_instance_extensions();
        assert_eq!(extensions[0], khr::Surface::name());
        assert!(extensions.contains(&vk::ExtHeadlessSurfaceFn::name()));
    }
}
