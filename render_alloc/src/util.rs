use std::{fmt, ptr::NonNull};

pub const fn is_power_of_two(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

/// Round `x` up to a multiple of `align`, which must be a power of two
pub const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Round `x` down to a multiple of `align`, which must be a power of two
pub const fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// Format a byte count with a binary unit suffix, e.g. `32.00 MiB`
pub fn human_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Pointer wrapper that prints as a hex address, for tracing fields
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsizePtr(usize);
impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const u8 as usize)
    }
}
impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const u8 as usize)
    }
}
impl<T: ?Sized> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr() as *const u8 as usize)
    }
}
