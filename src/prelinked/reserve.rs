//! Capacity planning for kext injection.

use super::constants::*;
use crate::error::Result;
use crate::util::{add_size, align_size};

/// Adds the worst-case image growth for one kext to `reserved_size`.
///
/// The Info.plist size gets [`PLIST_RESERVE_SLACK`] bytes of headroom for the
/// keys injection adds, and the executable size gets
/// [`EXECUTABLE_RESERVE_SLACK`] for link-time bookkeeping. Each is aligned to
/// [`PRELINKED_ALIGNMENT`] before being accumulated. Metadata-only kexts pass
/// an executable size of zero and still reserve the executable slack.
///
/// On overflow the call fails with `CapacityOverflow` and `reserved_size` is
/// left unchanged.
pub fn reserve_kext_size(reserved_size: &mut u32, info_plist_size: u32, executable_size: u32) -> Result<()> {
    let info_plist_size = align_size(add_size(info_plist_size, PLIST_RESERVE_SLACK)?, PRELINKED_ALIGNMENT)?;

    let executable_size = align_size(add_size(executable_size, EXECUTABLE_RESERVE_SLACK)?, PRELINKED_ALIGNMENT)?;

    let total = add_size(*reserved_size, info_plist_size)?;
    *reserved_size = add_size(total, executable_size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_reserve_rounds_with_slack() {
        let mut reserved = 0;
        reserve_kext_size(&mut reserved, 0x200, 0x2050).unwrap();
        // 0x200 + 512 -> 0x1000, 0x2050 + 8192 -> 0x5000
        assert_eq!(reserved, 0x6000);

        let mut reserved = 0x1000;
        reserve_kext_size(&mut reserved, 0x10, 0).unwrap();
        assert_eq!(reserved, 0x4000);
    }

    #[test]
    fn test_reserve_is_additive() {
        let (a, b, c, d) = (0x1234, 0x8000, 0x0e00, 0x10);

        let mut twice = 0;
        reserve_kext_size(&mut twice, a, b).unwrap();
        reserve_kext_size(&mut twice, c, d).unwrap();

        let mut separate_a = 0;
        reserve_kext_size(&mut separate_a, a, b).unwrap();
        let mut separate_c = 0;
        reserve_kext_size(&mut separate_c, c, d).unwrap();

        assert_eq!(twice, separate_a + separate_c);

        let mut once = 0;
        reserve_kext_size(&mut once, a + c, b + d).unwrap();
        // Per-call rounding can only make the split reservation larger.
        assert!(twice >= once);
        assert!(twice - once <= 2 * (PRELINKED_ALIGNMENT + PLIST_RESERVE_SLACK + EXECUTABLE_RESERVE_SLACK));
    }

    #[test]
    fn test_reserve_overflow_leaves_accumulator() {
        let mut reserved = 0x1000;
        let err = reserve_kext_size(&mut reserved, u32::MAX, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityOverflow);
        assert_eq!(reserved, 0x1000);

        let err = reserve_kext_size(&mut reserved, 0, u32::MAX - 0x1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityOverflow);
        assert_eq!(reserved, 0x1000);

        let mut reserved = u32::MAX - 0x1000;
        let err = reserve_kext_size(&mut reserved, 0x10, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityOverflow);
        assert_eq!(reserved, u32::MAX - 0x1000);
    }
}
