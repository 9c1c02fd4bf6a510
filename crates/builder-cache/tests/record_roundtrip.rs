// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Round-trip law: `ActionRecord → CBOR → ActionRecord` is identity for all
//! records.
#![allow(clippy::unwrap_used)]

use builder_cache::{ActionId, ActionRecord};
use builder_cas::Digest;
use proptest::prelude::*;
use std::path::PathBuf;

fn digest_strategy() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest)
}

fn record_strategy() -> impl Strategy<Value = ActionRecord> {
    (
        digest_strategy(),
        prop::collection::vec(("[a-z]{1,12}(/[a-z]{1,12}){0,3}", digest_strategy()), 0..8),
        any::<bool>(),
        digest_strategy(),
        prop::option::of(any::<i32>()),
        any::<u64>(),
    )
        .prop_map(|(action, outputs, success, stderr, exit_code, wall_ms)| ActionRecord {
            action: ActionId(action),
            outputs: outputs
                .into_iter()
                .map(|(path, digest)| (PathBuf::from(path), digest))
                .collect(),
            success,
            stderr,
            exit_code,
            wall_ms,
        })
}

proptest! {
    #[test]
    fn cbor_round_trip_is_identity(record in record_strategy()) {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&record, &mut bytes).unwrap();
        let back: ActionRecord = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        prop_assert_eq!(record, back);
    }
}
