use std::mem::size_of;

use windows::core::PWSTR;
use windows::Win32::System::SystemInformation::{GetComputerNameW, GetVersionExW, OSVERSIONINFOW};

pub fn os_version_string() -> String {
    unsafe {
        let mut info = OSVERSIONINFOW {
            dwOSVersionInfoSize: size_of::<OSVERSIONINFOW>() as u32,
            ..Default::default()
        };
        if GetVersionExW(&mut info).is_ok() {
            return format!(
                "{}.{}.{}",
                info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber
            );
        }
    }
    "unknown".to_string()
}

pub fn machine_name_string() -> String {
    let mut buf = [0u16; 256];
    let mut size = buf.len() as u32;
    unsafe {
        if GetComputerNameW(PWSTR(buf.as_mut_ptr()), &mut size).is_ok() {
            return String::from_utf16_lossy(&buf[..size as usize]);
        }
    }
    "unknown".to_string()
}
