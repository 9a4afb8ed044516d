//! Thin libc wrappers for the few syscalls the daemon issues itself
//!
//! Everything else (namespaces, cgroups, process supervision) is the
//! runtime's job.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::path::Path;

/// Mount flags
pub mod mount_flags {
    pub const MS_RDONLY: u64 = libc::MS_RDONLY;
    pub const MS_NOSUID: u64 = libc::MS_NOSUID;
    pub const MS_NODEV: u64 = libc::MS_NODEV;
    pub const MS_NOEXEC: u64 = libc::MS_NOEXEC;
    pub const MS_REMOUNT: u64 = libc::MS_REMOUNT;
    pub const MS_BIND: u64 = libc::MS_BIND;
    pub const MS_REC: u64 = libc::MS_REC;
    pub const MS_PRIVATE: u64 = libc::MS_PRIVATE;
}

/// Umount flags
pub mod umount_flags {
    pub const MNT_DETACH: i32 = libc::MNT_DETACH;
}

/// Result type for syscall operations
pub type SyscallResult<T> = std::result::Result<T, io::Error>;

fn cstring(s: &str, what: &str) -> SyscallResult<CString> {
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid {}", what)))
}

fn path_str<'a>(p: &'a Path, what: &str) -> SyscallResult<&'a str> {
    p.to_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("non-utf8 {}", what)))
}

/// Translate `mount(8)`-style options into flags and leftover data
pub fn parse_mount_options(options: &[String]) -> (u64, String) {
    let mut flags = 0u64;
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "ro" => flags |= mount_flags::MS_RDONLY,
            "rw" => flags &= !mount_flags::MS_RDONLY,
            "nosuid" => flags |= mount_flags::MS_NOSUID,
            "nodev" => flags |= mount_flags::MS_NODEV,
            "noexec" => flags |= mount_flags::MS_NOEXEC,
            "bind" => flags |= mount_flags::MS_BIND,
            "rbind" => flags |= mount_flags::MS_BIND | mount_flags::MS_REC,
            other => data.push(other.to_string()),
        }
    }
    (flags, data.join(","))
}

/// Mount a filesystem
pub fn mount(
    source: &str,
    target: &Path,
    fstype: Option<&str>,
    flags: u64,
    data: Option<&str>,
) -> SyscallResult<()> {
    let source_cstr = cstring(source, "source path")?;
    let target_cstr = cstring(path_str(target, "target path")?, "target path")?;
    let fstype_cstr = fstype.map(|s| cstring(s, "fstype")).transpose()?;
    let data_cstr = data
        .filter(|d| !d.is_empty())
        .map(|s| cstring(s, "data"))
        .transpose()?;

    let fstype_ptr = fstype_cstr
        .as_ref()
        .map(|s| s.as_ptr())
        .unwrap_or(std::ptr::null());
    let data_ptr = data_cstr
        .as_ref()
        .map(|s| s.as_ptr() as *const libc::c_void)
        .unwrap_or(std::ptr::null());

    let result = unsafe {
        libc::mount(
            source_cstr.as_ptr(),
            target_cstr.as_ptr(),
            fstype_ptr,
            flags,
            data_ptr,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Unmount a filesystem
pub fn umount2(target: &Path, flags: i32) -> SyscallResult<()> {
    let target_cstr = cstring(path_str(target, "target path")?, "target path")?;

    let result = unsafe { libc::umount2(target_cstr.as_ptr(), flags) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Anonymous close-on-exec pipe as `(read end, write end)`
pub fn pipe() -> SyscallResult<(File, File)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    // Both descriptors are fresh and owned by nobody else
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Send a signal to a process
pub fn kill(pid: i32, signal: i32) -> SyscallResult<()> {
    let result = unsafe { libc::kill(pid, signal) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Whether `pid` names a live process we may signal
pub fn process_alive(pid: i32) -> bool {
    pid > 0 && kill(pid, 0).is_ok()
}

/// Major and minor number of a device node
pub fn device_numbers(rdev: u64) -> (i64, i64) {
    let major = libc::major(rdev as libc::dev_t);
    let minor = libc::minor(rdev as libc::dev_t);
    (major as i64, minor as i64)
}

/// Signal number for a name such as `SIGTERM`, `TERM` or `15`
pub fn parse_signal(name: &str) -> Option<i32> {
    if let Ok(n) = name.parse::<i32>() {
        return (n > 0 && n < 65).then_some(n);
    }
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    let sig = match bare {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "STOP" => libc::SIGSTOP,
        "CONT" => libc::SIGCONT,
        "WINCH" => libc::SIGWINCH,
        _ => return None,
    };
    Some(sig)
}
