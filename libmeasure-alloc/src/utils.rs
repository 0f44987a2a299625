// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Rounds `n` up to the next power of two. Zero rounds up to one, and values
/// that would overflow saturate at the highest representable power of two.
pub fn npot(n: u64) -> u64 {
    n.checked_next_power_of_two().unwrap_or(1 << (u64::BITS - 1))
}

/// Rounds `n` up to a multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn round_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(n.checked_add(align - 1)? & !(align - 1))
}

/// https://doc.rust-lang.org/beta/std/primitive.pointer.html#method.is_aligned_to
/// Convenience function until the std lib standardizes this.
#[cfg(test)]
#[track_caller]
pub(crate) fn is_aligned_to<T>(p: *const T, align: usize) -> bool {
    p.align_offset(align) == 0
}

#[cfg(test)]
pub(crate) fn fuzzer_inner_loop(
    manager: &mut crate::PageManager,
    size: usize,
    align_bits: u32,
    idx: usize,
    val: u8,
) {
    let idx = if size > 0 { idx % size } else { 0 };
    let align = 1usize << align_bits;

    match manager.aligned_alloc(align, size) {
        Ok(ptr) => {
            assert!(is_aligned_to(ptr.cast::<u8>().as_ptr(), align));
            assert_eq!(ptr.len(), size);
            if size > 0 {
                // SAFETY: the allocation is exclusively ours and `idx < size`.
                unsafe {
                    let byte = ptr.cast::<u8>().as_ptr().add(idx);
                    byte.write(val);
                    assert_eq!(byte.read(), val);
                }
            }
        }
        Err(_) => {
            // Either the alignment is not supported or the budget is gone.
            // Neither may corrupt the manager.
            let _ = manager.stats();
        }
    }

    if let Ok(handle) = manager.alloc_movable(size) {
        assert!(!handle.is_null());
        if let Some(bytes) = manager.bytes_mut(handle, size) {
            if size > 0 {
                bytes[idx] = val;
            }
        }
        let bytes = manager.bytes(handle, size).unwrap();
        if size > 0 {
            assert_eq!(bytes[idx], val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npot() {
        assert_eq!(npot(0), 1);
        assert_eq!(npot(1), 1);
        assert_eq!(npot(511), 512);
        assert_eq!(npot(512), 512);
        assert_eq!(npot(513), 1024);
        assert_eq!(npot(u64::MAX), 1 << 63);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), Some(0));
        assert_eq!(round_up(1, 8), Some(8));
        assert_eq!(round_up(8, 8), Some(8));
        assert_eq!(round_up(17, 16), Some(32));
        assert_eq!(round_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_is_aligned_to() {
        #[repr(C, align(16))]
        struct Wide {
            data: [u8; 16],
        }

        static WIDE: Wide = Wide { data: [0; 16] };

        let wide = core::ptr::addr_of!(WIDE);
        assert!(is_aligned_to(wide, 1 << 4));

        let twelve = core::ptr::addr_of!(WIDE.data[12]);
        assert!(is_aligned_to(twelve, 1 << 2));
        assert!(!is_aligned_to(twelve, 1 << 3));
    }
}
