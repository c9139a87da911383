use anyhow::{anyhow, Result};
use std::path::Path;
use windows::core::PCWSTR;
use windows::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

/// Bytes available to the caller on the volume holding `path`.
pub fn free_space_bytes(path: &Path) -> Result<u64> {
    let wide = wide(path);
    let mut free = 0u64;
    let ok = unsafe {
        GetDiskFreeSpaceExW(PCWSTR(wide.as_ptr()), Some(&mut free as *mut u64), None, None)
    };
    if ok.is_ok() {
        Ok(free)
    } else {
        Err(anyhow!("GetDiskFreeSpaceExW failed for {}", path.display()))
    }
}

fn wide(path: &Path) -> Vec<u16> {
    use std::os::windows::prelude::*;
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}
