//! Utility functions for disk space queries and size formatting

use std::path::Path;

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux: statvfs
/// - macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
///
/// # Arguments
///
/// * `path` - The path to check (typically the parity or temp directory)
///
/// # Returns
///
/// Returns the available disk space in bytes, or an IO error if the check fails.
///
/// # Examples
///
/// ```ignore
/// let available = get_available_space(Path::new("/parity"))?;
/// println!("Available space: {} GB", available / (1024 * 1024 * 1024));
/// ```
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        // Convert path to C string for statvfs call
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: This is safe because:
        // 1. c_path is a valid, null-terminated C string created from the input path
        // 2. stat is properly initialized with zeroed memory before the call
        // 3. We check the return value and propagate any OS errors
        // 4. The statvfs struct is only read after a successful call
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // Available space = available blocks * block size
            // f_bavail is available blocks for unprivileged users
            // f_frsize is the fragment size (preferred over f_bsize)
            let available_bytes = stat.f_bavail.saturating_mul(stat.f_frsize);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        // Convert path to wide string for Windows API
        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0)) // null terminator
            .collect();

        // SAFETY: This is safe because:
        // 1. wide_path is a valid, null-terminated wide string
        // 2. All output pointers point to valid, properly aligned u64 variables
        // 3. We check the return value and propagate any OS errors
        // 4. The output variables are only read after a successful call
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        // Unsupported platform - return an error
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

/// Format a byte count as a short human-readable size string
///
/// Picks the largest unit that keeps the value above 1 and renders one
/// decimal place for fractional values (e.g. "1.5 MB", "640 KB", "12 bytes").
/// Used in log lines and status strings, never for arithmetic.
#[must_use]
pub fn smart_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    match bytes {
        b if b >= TB => format!("{:.1} TB", b as f64 / TB as f64),
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        1 => "1 byte".to_string(),
        b => format!("{b} bytes"),
    }
}
