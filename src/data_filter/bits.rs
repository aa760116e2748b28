//! Bit gather/scatter primitives
//!
//! `bit_gather` collects the bits of a word selected by a mask into a
//! contiguous right-aligned result:
//!
//! ```text
//!  w = 00A0BC00
//!  m = 00101100
//!  ==> 00000ABC
//! ```
//!
//! When the crate is compiled with BMI2 enabled the hardware `pext`
//! instruction is used, otherwise a portable loop. Both produce identical
//! results for every input.

/// Portable bit gather, one iteration per mask bit.
#[inline]
pub fn bit_gather_soft(w: u32, mut m: u32) -> u32 {
    let mut z = 0u32;
    let mut b = 1u32;
    while m != 0 {
        let i = m & m.wrapping_neg();
        m ^= i;
        if i & w != 0 {
            z |= b;
        }
        b <<= 1;
    }
    z
}

/// Inverse of [`bit_gather_soft`]: distribute the low bits of `w` to the
/// positions set in `m`.
#[inline]
pub fn bit_scatter(w: u32, mut m: u32) -> u32 {
    let mut z = 0u32;
    let mut b = 1u32;
    while m != 0 {
        let i = m & m.wrapping_neg();
        m ^= i;
        if b & w != 0 {
            z |= i;
        }
        b <<= 1;
    }
    z
}

#[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
#[inline]
pub fn bit_gather(w: u32, m: u32) -> u32 {
    // SAFETY: the bmi2 target feature is enabled at compile time.
    unsafe { core::arch::x86_64::_pext_u32(w, m) }
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "bmi2")))]
#[inline]
pub fn bit_gather(w: u32, m: u32) -> u32 {
    bit_gather_soft(w, m)
}

/// Hardware gather if the running CPU supports BMI2.
///
/// Used to cross-check the portable path on machines where the crate was
/// not compiled with BMI2 enabled.
#[cfg(target_arch = "x86_64")]
pub fn bit_gather_hw(w: u32, m: u32) -> Option<u32> {
    #[target_feature(enable = "bmi2")]
    unsafe fn pext(w: u32, m: u32) -> u32 {
        core::arch::x86_64::_pext_u32(w, m)
    }

    if std::is_x86_feature_detected!("bmi2") {
        // SAFETY: runtime detection above guarantees bmi2 support.
        Some(unsafe { pext(w, m) })
    } else {
        None
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn bit_gather_hw(_w: u32, _m: u32) -> Option<u32> {
    None
}
