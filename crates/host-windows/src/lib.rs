pub mod devices;
pub mod driver_store;
pub mod process;
pub mod system;

#[cfg(windows)]
pub mod space;
#[cfg(not(windows))]
#[path = "space_stub.rs"]
pub mod space;

#[cfg(windows)]
mod win;

use driverpilot_core::HostInfo;

pub fn host_info() -> HostInfo {
    #[cfg(windows)]
    {
        HostInfo {
            os: "windows".to_string(),
            os_version: win::os_version_string(),
            machine: win::machine_name_string(),
        }
    }
    #[cfg(not(windows))]
    {
        HostInfo {
            os: std::env::consts::OS.to_string(),
            os_version: "unknown".to_string(),
            machine: "unknown".to_string(),
        }
    }
}
