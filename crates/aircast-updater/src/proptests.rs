//! Property-based tests for aircast-updater.
//!
//! # Properties Tested
//!
//! - Version ordering is a total order (reflexive, antisymmetric, transitive)
//! - Trailing zero components and build metadata do not affect ordering
//! - Numeric components compare as unbounded integers
//! - Any modification of a signed payload is detected
//! - Selection picks the maximum applicable version regardless of feed order
//! - A malformed entry never poisons the rest of the feed

#![cfg(test)]

use std::cmp::Ordering;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use proptest::prelude::*;
use sha2::{Digest, Sha256};

use crate::feed::{DownloadVariant, Feed, FeedEntry, SignatureBlock};
use crate::hooks::PolicyHooks;
use crate::host::HostEnvironment;
use crate::parser::FeedParser;
use crate::selector::CandidateSelector;
use crate::verify::TrustVerifier;
use crate::version::Version;

// =============================================================================
// Generators
// =============================================================================

/// Version-like strings, including pre-release tags and junk separators.
fn arb_version_string() -> impl Strategy<Value = String> {
    prop_oneof![
        "[0-9]{1,3}(\\.[0-9]{1,3}){0,3}",
        "[0-9]{1,2}\\.[0-9]{1,2}(a|b|rc|beta|alpha)[0-9]{0,2}",
        "[0-9a-z.\\-_]{0,12}",
    ]
}

/// Dotted numeric versions.
fn arb_numeric_version() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..50, 1..4)
}

fn dotted(parts: &[u32]) -> String {
    parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

fn cmp(a: &str, b: &str) -> Ordering {
    Version::compare(&Version::parse(a), &Version::parse(b))
}

// =============================================================================
// Version ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_compare_is_reflexive(a in arb_version_string()) {
        prop_assert_eq!(cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn prop_compare_is_antisymmetric(a in arb_version_string(), b in arb_version_string()) {
        prop_assert_eq!(cmp(&a, &b), cmp(&b, &a).reverse());
    }

    #[test]
    fn prop_compare_is_transitive(
        a in arb_version_string(),
        b in arb_version_string(),
        c in arb_version_string(),
    ) {
        let mut sorted = vec![Version::parse(&a), Version::parse(&b), Version::parse(&c)];
        sorted.sort();
        prop_assert!(sorted[0] <= sorted[1]);
        prop_assert!(sorted[1] <= sorted[2]);
        prop_assert!(sorted[0] <= sorted[2]);
    }

    #[test]
    fn prop_trailing_zeros_are_insignificant(parts in arb_numeric_version(), zeros in 1usize..3) {
        let base = dotted(&parts);
        let padded = format!("{}{}", base, ".0".repeat(zeros));
        prop_assert_eq!(cmp(&base, &padded), Ordering::Equal);
    }

    #[test]
    fn prop_build_metadata_is_ignored(parts in arb_numeric_version(), build in "[0-9a-z.]{1,8}") {
        let base = dotted(&parts);
        prop_assert_eq!(cmp(&base, &format!("{}+{}", base, build)), Ordering::Equal);
    }

    #[test]
    fn prop_numeric_order_matches_integers(a in any::<u128>(), b in any::<u128>()) {
        prop_assert_eq!(cmp(&a.to_string(), &b.to_string()), a.cmp(&b));
    }

    #[test]
    fn prop_dotted_order_matches_tuples(a in arb_numeric_version(), b in arb_numeric_version()) {
        let pad = |v: &[u32]| {
            let mut v = v.to_vec();
            v.resize(4, 0);
            v
        };
        prop_assert_eq!(cmp(&dotted(&a), &dotted(&b)), pad(&a).cmp(&pad(&b)));
    }

    #[test]
    fn prop_prerelease_sorts_below_release(parts in arb_numeric_version(), tag in "(a|b|rc|beta)") {
        let release = dotted(&parts);
        prop_assert_eq!(cmp(&format!("{}{}", release, tag), &release), Ordering::Less);
    }
}

// =============================================================================
// Tamper detection
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_signed_payload_verifies(key in arb_signing_key(), payload in arb_payload()) {
        let verifier = TrustVerifier::new(vec![key.verifying_key()]);
        let mut variant = DownloadVariant::new("https://example.com/p.bin");
        variant.signature = Some(SignatureBlock::new("ed25519", key.sign(&payload).to_bytes().to_vec()));
        variant.sha256 = Some(Sha256::digest(&payload).into());

        prop_assert!(verifier.verify_variant(&payload, &variant).is_ok());
    }

    #[test]
    fn prop_modified_payload_is_rejected(
        key in arb_signing_key(),
        payload in arb_payload(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let verifier = TrustVerifier::new(vec![key.verifying_key()]);
        let mut variant = DownloadVariant::new("https://example.com/p.bin");
        variant.signature = Some(SignatureBlock::new("ed25519", key.sign(&payload).to_bytes().to_vec()));

        let mut tampered = payload.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;

        prop_assert!(verifier.verify_variant(&tampered, &variant).is_err());
    }

    #[test]
    fn prop_appended_bytes_are_rejected(
        key in arb_signing_key(),
        payload in arb_payload(),
        extra in prop::collection::vec(any::<u8>(), 1..16),
    ) {
        let verifier = TrustVerifier::new(vec![key.verifying_key()]);
        let mut variant = DownloadVariant::new("https://example.com/p.bin");
        variant.signature = Some(SignatureBlock::new("ed25519", key.sign(&payload).to_bytes().to_vec()));

        let mut extended = payload.clone();
        extended.extend_from_slice(&extra);
        prop_assert!(verifier.verify_variant(&extended, &variant).is_err());
    }

    #[test]
    fn prop_foreign_key_is_rejected(
        signer in arb_signing_key(),
        trusted in arb_signing_key(),
        payload in arb_payload(),
    ) {
        prop_assume!(signer.to_bytes() != trusted.to_bytes());
        let verifier = TrustVerifier::new(vec![trusted.verifying_key()]);
        let block = SignatureBlock::new("ed25519", signer.sign(&payload).to_bytes().to_vec());

        prop_assert!(verifier.verify(&payload, Some(&block)).is_err());
    }
}

// =============================================================================
// Selection and parsing
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_selection_picks_maximum_newer(
        versions in prop::collection::vec(arb_numeric_version(), 1..8),
        current in arb_numeric_version(),
    ) {
        let feed = Feed {
            entries: versions
                .iter()
                .map(|v| FeedEntry::new(dotted(v), vec![DownloadVariant::new("https://example.com/p.bin")]))
                .collect(),
            ..Feed::default()
        };
        let current = Version::parse(&dotted(&current));
        let host = HostEnvironment::new("linux-x86_64", Version::parse("6.1"));

        let selected = CandidateSelector::new()
            .select(&feed, &current, &host, &PolicyHooks::new())
            .unwrap();
        let expected = feed.entries.iter().map(|e| &e.version).filter(|v| **v > current).max();

        match (selected, expected) {
            (Some(c), Some(max)) => prop_assert_eq!(&c.entry.version, max),
            (None, None) => {}
            (got, want) => prop_assert!(false, "selected {:?}, expected {:?}", got.map(|c| c.entry.version), want),
        }
    }

    #[test]
    fn prop_bad_entries_are_dropped_individually(
        good in prop::collection::vec(arb_numeric_version(), 0..6),
        bad_positions in prop::collection::vec(any::<prop::sample::Index>(), 0..4),
    ) {
        let mut entries: Vec<serde_json::Value> = good
            .iter()
            .map(|v| serde_json::json!({
                "version": dotted(v),
                "variants": [{ "url": "https://example.com/p.bin" }],
            }))
            .collect();
        for position in &bad_positions {
            let at = position.index(entries.len() + 1);
            entries.insert(at, serde_json::json!({ "title": "no version", "variants": [] }));
        }
        let document = serde_json::to_vec(&serde_json::json!({ "entries": entries })).unwrap();

        let report = FeedParser::new().parse_with_report(&document).unwrap();
        prop_assert_eq!(report.feed.len(), good.len());
        prop_assert_eq!(report.dropped.len(), bad_positions.len());

        let parsed: Vec<String> = report.feed.entries.iter().map(|e| e.version.to_string()).collect();
        let expected: Vec<String> = good.iter().map(|v| dotted(v)).collect();
        prop_assert_eq!(parsed, expected);
    }

    #[test]
    fn prop_signature_value_survives_feed_encoding(key in arb_signing_key(), payload in arb_payload()) {
        let signature = key.sign(&payload).to_bytes();
        let document = serde_json::to_vec(&serde_json::json!({
            "entries": [{
                "version": "2.0",
                "variants": [{
                    "url": "https://example.com/p.bin",
                    "signature": {
                        "algorithm": "ed25519",
                        "value": base64::engine::general_purpose::STANDARD.encode(signature),
                    },
                }],
            }],
        }))
        .unwrap();

        let feed = FeedParser::new().parse(&document).unwrap();
        let variant = &feed.entries[0].variants[0];
        let verifier = TrustVerifier::new(vec![key.verifying_key()]);
        prop_assert!(verifier.verify_variant(&payload, variant).is_ok());
    }
}
