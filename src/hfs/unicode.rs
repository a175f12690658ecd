//! HFS+ name handling: UTF-16 big-endian strings, the case-folding
//! comparator used by case-insensitive catalogs, and the `:` / `/` swap
//! between POSIX paths and on-disk names.

use std::cmp::Ordering;

/// An HFS+ name: up to 255 UTF-16 code units.
pub type HfsStr = Vec<u16>;

pub const MAX_NAME_UNITS: usize = 255;

/// Convert a POSIX path component into on-disk UTF-16 units. HFS+ stores a
/// literal `/` where POSIX shows `:` and vice versa.
pub fn name_to_units(name: &str) -> HfsStr {
    name.encode_utf16()
        .map(|u| match u {
            0x3A => 0x2F, // ':' stored as '/'
            0x2F => 0x3A, // '/' stored as ':'
            other => other,
        })
        .collect()
}

/// Convert on-disk UTF-16 units back into a POSIX-visible name.
pub fn units_to_name(units: &[u16]) -> String {
    let swapped: Vec<u16> = units
        .iter()
        .map(|&u| match u {
            0x2F => 0x3A,
            0x3A => 0x2F,
            other => other,
        })
        .collect();
    String::from_utf16_lossy(&swapped)
}

/// Case-sensitive (binary) comparison, used by HFSX catalogs and the
/// extents-overflow tree key prefix.
pub fn binary_compare(a: &[u16], b: &[u16]) -> Ordering {
    a.cmp(b)
}

/// Case-insensitive comparison for HFS+ catalogs: fold each code unit, skip
/// ignorable units, and order a shared prefix by length.
pub fn fast_unicode_compare(a: &[u16], b: &[u16]) -> Ordering {
    let mut ai = a.iter();
    let mut bi = b.iter();
    loop {
        let ca = next_folded(&mut ai);
        let cb = next_folded(&mut bi);
        match (ca, cb) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

fn next_folded<'a>(it: &mut impl Iterator<Item = &'a u16>) -> Option<u16> {
    for &u in it {
        let folded = fold_unit(u);
        if folded != 0 {
            return Some(folded);
        }
    }
    None
}

/// Per-unit case fold. A zero result marks the unit ignorable.
fn fold_unit(u: u16) -> u16 {
    match u {
        // NUL is ignorable in name comparison.
        0x0000 => 0,
        // ASCII uppercase.
        0x0041..=0x005A => u + 0x20,
        // Latin-1 uppercase, except the multiplication sign.
        0x00C0..=0x00D6 | 0x00D8..=0x00DE => u + 0x20,
        // Remaining BMP units: fold through the simple lowercase mapping
        // when it stays a single BMP unit.
        _ => match char::from_u32(u as u32) {
            Some(c) => {
                let mut lower = c.to_lowercase();
                match (lower.next(), lower.next()) {
                    (Some(l), None) if (l as u32) <= 0xFFFF => l as u16,
                    _ => u,
                }
            }
            None => u,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_fold_equal_ignores_case() {
        assert_eq!(
            fast_unicode_compare(&units("ReadMe.TXT"), &units("readme.txt")),
            Ordering::Equal
        );
    }

    #[test]
    fn test_compare_reflexive() {
        for name in ["", "a", "Fichier élevé", "数据"] {
            assert_eq!(
                fast_unicode_compare(&units(name), &units(name)),
                Ordering::Equal
            );
        }
    }

    #[test]
    fn test_shorter_prefix_sorts_first() {
        assert_eq!(
            fast_unicode_compare(&units("abc"), &units("abcd")),
            Ordering::Less
        );
        assert_eq!(
            fast_unicode_compare(&units("abcd"), &units("abc")),
            Ordering::Greater
        );
    }

    #[test]
    fn test_binary_compare_is_case_sensitive() {
        assert_ne!(
            binary_compare(&units("A"), &units("a")),
            Ordering::Equal
        );
    }

    #[test]
    fn test_colon_slash_swap_roundtrip() {
        let on_disk = name_to_units("a:b");
        assert_eq!(on_disk, units("a/b"));
        assert_eq!(units_to_name(&on_disk), "a:b");
    }
}
