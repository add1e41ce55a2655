//! Plugin descriptor: the static, `Copy` entry in a host's plugin table.

use super::Plugin;

// ─── API versioning ──────────────────────────────────────────────────────────

/// Current Tessera plugin API version (1.0).
pub const TESSERA_PLUGIN_API_VERSION: u32 = 0x0001_0000;

// ─── PluginDescriptor ────────────────────────────────────────────────────────

/// Identifies and instantiates a plugin.
///
/// Hosts list their plugins in a static table instead of loading modules by
/// path:
///
/// ```rust,ignore
/// pub static WEATHER: PluginDescriptor = PluginDescriptor::new("weather", weather_plugin);
///
/// fn weather_plugin() -> Plugin {
///     Plugin::builder("weather").on_install(install).build()
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    /// Plugin API version this descriptor was compiled against.
    pub api_version: u32,

    /// Plugin name; also the key of its config section.
    pub name: &'static str,

    /// Factory creating a fresh [`Plugin`] instance.
    pub create: fn() -> Plugin,
}

impl PluginDescriptor {
    /// Creates a descriptor targeting the current API version.
    pub const fn new(name: &'static str, create: fn() -> Plugin) -> Self {
        Self {
            api_version: TESSERA_PLUGIN_API_VERSION,
            name,
            create,
        }
    }

    /// Returns `true` if this descriptor's API version is compatible with the
    /// running framework.
    ///
    /// The major part must match exactly; the descriptor's minor part must be
    /// ≤ the host's minor part.
    pub fn is_compatible(&self) -> bool {
        let host_major = TESSERA_PLUGIN_API_VERSION >> 16;
        let desc_major = self.api_version >> 16;
        let desc_minor = self.api_version & 0xFFFF;
        let host_minor = TESSERA_PLUGIN_API_VERSION & 0xFFFF;
        desc_major == host_major && desc_minor <= host_minor
    }

    /// Creates a fresh plugin from the factory function.
    #[inline]
    pub fn instantiate(&self) -> Plugin {
        (self.create)()
    }
}
