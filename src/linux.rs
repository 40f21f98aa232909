//! Thin veneers over the Linux bits the profiler needs: thread identity,
//! `/proc/self/status`, glibc's `malloc_info` and wallclock formatting.

use std::{fs, io, ptr};

/// OS thread id of the caller, as the kernel sees it (not the opaque pthread
/// handle).
pub(crate) fn gettid() -> i32 {
  // SAFETY: gettid takes no arguments and cannot fail.
  unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Name of the calling thread via `prctl(PR_GET_NAME)`. The kernel limits
/// thread names to 16 bytes including the terminator.
pub(crate) fn current_thread_name() -> [u8; 16] {
  let mut name = [0u8; 16];
  // SAFETY: PR_GET_NAME writes at most 16 bytes into the provided buffer.
  unsafe {
    libc::prctl(libc::PR_GET_NAME, name.as_mut_ptr());
  }
  name
}

/// `VmSize` of this process in bytes.
///
/// # Errors
///
/// Returns an error if `/proc/self/status` cannot be read or the field is
/// missing.
pub(crate) fn vm_size_bytes() -> io::Result<u64> {
  status_field_bytes("VmSize:")
}

/// `VmRSS` of this process in bytes.
///
/// # Errors
///
/// Returns an error if `/proc/self/status` cannot be read or the field is
/// missing.
pub(crate) fn vm_rss_bytes() -> io::Result<u64> {
  status_field_bytes("VmRSS:")
}

fn status_field_bytes(field: &str) -> io::Result<u64> {
  let status = fs::read_to_string("/proc/self/status")?;
  parse_status_field(&status, field).ok_or_else(|| {
    io::Error::new(
      io::ErrorKind::InvalidData,
      format!("field {field} not found in /proc/self/status"),
    )
  })
}

// Status lines look like "VmSize:    123456 kB"; the kernel's kB unit is
// 1024 bytes.
fn parse_status_field(status: &str, field: &str) -> Option<u64> {
  let line = status.lines().find(|line| line.starts_with(field))?;
  let kb = line
    .split_whitespace()
    .nth(1)
    .and_then(|raw| raw.parse::<u64>().ok())?;
  Some(kb * 1024)
}

/// Stack size reserved for the calling thread, per its pthread attributes.
///
/// # Errors
///
/// Returns the underlying pthread error code as an `io::Error`.
pub(crate) fn thread_stack_size() -> io::Result<u64> {
  // SAFETY: the attr struct is zeroed, filled by pthread_getattr_np and
  // always destroyed before returning.
  unsafe {
    let mut attr: libc::pthread_attr_t = std::mem::zeroed();
    let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
    if rc != 0 {
      return Err(io::Error::from_raw_os_error(rc));
    }

    let mut stack_size: libc::size_t = 0;
    let rc = libc::pthread_attr_getstacksize(&attr, &mut stack_size);
    libc::pthread_attr_destroy(&mut attr);
    if rc != 0 {
      return Err(io::Error::from_raw_os_error(rc));
    }

    Ok(stack_size as u64)
  }
}

/// Local wallclock formatted as `YYYY-MM-DD @ HH:MM:SS TZ`.
pub(crate) fn wallclock_string() -> String {
  // SAFETY: localtime_r and strftime only touch the buffers handed to them.
  unsafe {
    let now = libc::time(ptr::null_mut());
    let mut tm: libc::tm = std::mem::zeroed();
    libc::localtime_r(&now, &mut tm);

    let mut buf = [0 as libc::c_char; 64];
    let written = libc::strftime(
      buf.as_mut_ptr(),
      buf.len(),
      c"%Y-%m-%d @ %H:%M:%S %Z".as_ptr(),
      &tm,
    );

    let bytes = std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), written);
    String::from_utf8_lossy(bytes).into_owned()
  }
}

/// The raw allocator's diagnostic XML, captured through an in-memory stream.
///
/// # Errors
///
/// Returns an error if the stream cannot be opened or `malloc_info` reports
/// failure.
pub(crate) fn malloc_info_string() -> io::Result<String> {
  // SAFETY: open_memstream owns the buffer until fclose; we copy it out and
  // release it with the matching free.
  unsafe {
    let mut buffer: *mut libc::c_char = ptr::null_mut();
    let mut size: libc::size_t = 0;
    let stream = libc::open_memstream(&mut buffer, &mut size);
    if stream.is_null() {
      return Err(io::Error::last_os_error());
    }

    let rc = libc::malloc_info(0, stream);
    libc::fclose(stream);
    if rc != 0 {
      if !buffer.is_null() {
        libc::free(buffer.cast());
      }
      return Err(io::Error::last_os_error());
    }

    let bytes = std::slice::from_raw_parts(buffer.cast::<u8>(), size);
    let info = String::from_utf8_lossy(bytes).into_owned();
    libc::free(buffer.cast());
    Ok(info)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_fields_parse_in_kernel_units() {
    let status = "Name:\tdemo\nVmSize:\t   2048 kB\nVmRSS:\t 512 kB\n";
    assert_eq!(parse_status_field(status, "VmSize:"), Some(2048 * 1024));
    assert_eq!(parse_status_field(status, "VmRSS:"), Some(512 * 1024));
    assert_eq!(parse_status_field(status, "VmSwap:"), None);
  }

  #[test]
  fn this_process_reports_plausible_vm_numbers() {
    let size = vm_size_bytes().expect("VmSize");
    let rss = vm_rss_bytes().expect("VmRSS");
    assert!(size > 0);
    assert!(rss > 0);
    assert!(size >= rss);
  }

  #[test]
  fn tid_is_stable_within_a_thread() {
    assert_eq!(gettid(), gettid());
    assert!(gettid() > 0);
  }

  #[test]
  fn wallclock_has_the_documented_shape() {
    let stamp = wallclock_string();
    // "2023-10-01 @ 12:34:56 UTC" and similar.
    assert!(stamp.contains(" @ "), "unexpected stamp: {stamp}");
    assert_eq!(&stamp[4..5], "-");
  }

  #[test]
  fn stack_size_is_nonzero() {
    assert!(thread_stack_size().expect("stack size") > 0);
  }
}
