use std::collections::HashSet;

use infra_test_harness::unique_id::{ALPHABET, MIN_LEN, UniqueIdError, decode, encode, encode_signed};

const REPRESENTATIVE: &[u64] = &[0, 1, 61, 62, 3843, 238_327, 1_700_000_000, 4_102_444_800];

/// Deterministic spread of inputs across the whole u64 range.
fn sweep() -> impl Iterator<Item = u64> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    (0..2_000).map(move |_| {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        state >> (state % 64)
    })
}

#[test]
fn ids_are_padded_and_use_the_alphabet() {
    for n in REPRESENTATIVE.iter().copied().chain(sweep()) {
        let id = encode(n);
        assert!(id.len() >= MIN_LEN, "{n} encoded too short: {id}");
        assert!(
            id.bytes().all(|b| ALPHABET.contains(&b)),
            "{n} produced a foreign symbol: {id}"
        );
        assert_eq!(encode(n), id, "encoding of {n} is not stable");
    }
}

#[test]
fn decoding_reconstructs_the_counter() {
    for n in REPRESENTATIVE.iter().copied().chain(sweep()) {
        assert_eq!(decode(&encode(n)), Ok(n));
    }
}

#[test]
fn documented_examples() {
    assert_eq!(encode(0), "000000");
    assert_eq!(encode(61), "00000z");
    assert_eq!(encode(62), "000010");
    assert_eq!(encode(1_700_000_000), "1r31eq");
}

#[test]
fn padding_stops_at_the_floor() {
    let six = encode(62u64.pow(6) - 1);
    let seven = encode(62u64.pow(6));
    assert_eq!(six, "zzzzzz");
    assert_eq!(seven.len(), 7);
    assert!(!seven.starts_with('0'));
}

#[test]
fn signed_counters() {
    assert_eq!(encode_signed(0), Ok("000000".to_string()));
    assert_eq!(encode_signed(3843), Ok(encode(3843)));
    assert_eq!(encode_signed(-62), Err(UniqueIdError::Negative(-62)));
}

#[test]
fn successive_seconds_give_distinct_ids() {
    let start = 1_700_000_000u64;
    let ids: HashSet<_> = (start..start + 10_000).map(encode).collect();
    assert_eq!(ids.len(), 10_000);

    // Lowercasing, as done for workspace names, can fold distinct counters together.
    assert_eq!(encode(10).to_ascii_lowercase(), encode(36).to_ascii_lowercase());
}

#[test]
fn concurrent_callers_agree() {
    let handles: Vec<_> = (0..8)
        .map(|_| std::thread::spawn(|| REPRESENTATIVE.iter().map(|&n| encode(n)).collect::<Vec<_>>()))
        .collect();
    let expected: Vec<_> = REPRESENTATIVE.iter().map(|&n| encode(n)).collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}
