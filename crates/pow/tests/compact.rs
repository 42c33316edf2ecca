use cfsync_pow::difficulty::{compact_to_target, hash_meets_target, target_to_compact};

#[test]
fn compact_target_roundtrip() {
    for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_04cb, 0x0312_3456] {
        let target = compact_to_target(bits).expect("target");
        assert_eq!(target_to_compact(&target), bits, "bits {bits:#x}");
    }
}

#[test]
fn regtest_target_layout() {
    let target = compact_to_target(0x207f_ffff).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(&target[29..], &[0xff, 0xff, 0x7f]);
}

#[test]
fn hash_compares_as_little_endian_number() {
    let mut target = [0u8; 32];
    target[31] = 0x01;
    let mut below = [0xffu8; 32];
    below[31] = 0x00;
    let mut above = [0u8; 32];
    above[31] = 0x02;
    assert!(hash_meets_target(&below, &target));
    assert!(hash_meets_target(&target, &target));
    assert!(!hash_meets_target(&above, &target));
}
