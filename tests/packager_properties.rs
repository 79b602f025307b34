//! Property-based tests for the packager's algebraic laws (splice
//! idempotence, size-estimate upper bound, delimiter-safety round-trip).

use proptest::prelude::*;
use telem_core::event::Priority;
use telem_core::pipeline::packager::Packager;
use telem_core::pipeline::serializer::SerializedRecord;

/// Record bytes drawn from an alphabet with no comma or bracket, so the
/// delimiter-safety round-trip split is unambiguous.
fn record_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"abcdefghijklmnopqrstuvwxyz0123456789".to_vec()), 1..12)
}

fn tenant_tokens() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Z][0-9]", 1..4)
}

proptest! {
    #[test]
    fn splice_is_idempotent(
        tenants in tenant_tokens(),
        records in prop::collection::vec((0usize..4, record_bytes()), 0..20),
    ) {
        let mut packager = Packager::new();
        let indices: Vec<_> = tenants.iter().map(|t| packager.add_tenant_token(t.clone())).collect();
        for (tenant_idx, bytes) in &records {
            if bytes.is_empty() {
                continue;
            }
            let idx = indices[tenant_idx % indices.len()];
            let record = SerializedRecord {
                bytes: bytes.clone(),
                tenant_token: tenants[tenant_idx % tenants.len()].clone(),
                priority: Priority::Normal,
                original_record_size: bytes.len(),
            };
            packager.add_record(idx, &record);
        }
        prop_assert_eq!(packager.splice(), packager.splice());
    }

    #[test]
    fn size_estimate_is_an_upper_bound(
        tenants in tenant_tokens(),
        records in prop::collection::vec((0usize..4, record_bytes()), 0..20),
    ) {
        let mut packager = Packager::new();
        let indices: Vec<_> = tenants.iter().map(|t| packager.add_tenant_token(t.clone())).collect();
        for (tenant_idx, bytes) in &records {
            if bytes.is_empty() {
                continue;
            }
            let idx = indices[tenant_idx % indices.len()];
            let record = SerializedRecord {
                bytes: bytes.clone(),
                tenant_token: tenants[tenant_idx % tenants.len()].clone(),
                priority: Priority::Normal,
                original_record_size: bytes.len(),
            };
            packager.add_record(idx, &record);
        }
        prop_assert!(packager.size_estimate() >= packager.splice().len());
    }

    #[test]
    fn delimiter_safety_round_trip(
        records in prop::collection::vec(record_bytes(), 1..15),
    ) {
        let mut packager = Packager::new();
        let idx = packager.add_tenant_token("T1");
        for bytes in &records {
            if bytes.is_empty() {
                continue;
            }
            let record = SerializedRecord {
                bytes: bytes.clone(),
                tenant_token: "T1".to_string(),
                priority: Priority::Normal,
                original_record_size: bytes.len(),
            };
            packager.add_record(idx, &record);
        }

        let framed = packager.splice();
        let inner = &framed[1..framed.len() - 1];
        let split: Vec<&[u8]> = if inner.is_empty() {
            Vec::new()
        } else {
            inner.split(|&b| b == b',').collect()
        };
        let expected: Vec<&[u8]> = records.iter().filter(|r| !r.is_empty()).map(|r| r.as_slice()).collect();
        prop_assert_eq!(split, expected);
    }
}
