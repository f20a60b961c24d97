//! Property-based tests for room keys and frame decoding.
//!
//! Uses proptest to verify:
//! 1. `RoomKey::between` is order-independent for any pair of user IDs.
//! 2. Distinct unordered pairs never share a key.
//! 3. A key's string form parses back to the same key.
//! 4. Random bytes never cause a panic in `decode` (returns `Err` gracefully).

use courier_proto::codec;
use courier_proto::ids::{RoomKey, UserId};
use courier_proto::message::validate_body;
use courier_proto::relay::{ClientFrame, ServerFrame};
use proptest::prelude::*;

/// Strategy for generating valid user IDs (no separator, 1..=64 chars).
fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-zA-Z0-9_\\-.@]{1,64}".prop_map(|s| UserId::parse(s).unwrap())
}

proptest! {
    #[test]
    fn room_key_is_symmetric(a in arb_user_id(), b in arb_user_id()) {
        prop_assert_eq!(RoomKey::between(&a, &b), RoomKey::between(&b, &a));
    }

    #[test]
    fn room_key_distinguishes_pairs(
        a in arb_user_id(),
        b in arb_user_id(),
        c in arb_user_id(),
        d in arb_user_id(),
    ) {
        let same_pair = (a == c && b == d) || (a == d && b == c);
        let keys_equal = RoomKey::between(&a, &b) == RoomKey::between(&c, &d);
        prop_assert_eq!(same_pair, keys_equal);
    }

    #[test]
    fn room_key_string_form_parses_back(a in arb_user_id(), b in arb_user_id()) {
        let key = RoomKey::between(&a, &b);
        prop_assert_eq!(RoomKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn room_key_includes_both_participants(a in arb_user_id(), b in arb_user_id()) {
        let key = RoomKey::between(&a, &b);
        prop_assert!(key.includes(&a));
        prop_assert!(key.includes(&b));
        prop_assert_eq!(key.other(&a), Some(&b));
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ClientFrame>(&bytes);
        let _ = codec::decode::<ServerFrame>(&bytes);
    }

    #[test]
    fn arbitrary_strings_never_panic_room_key_parse(s in ".{0,80}") {
        let _ = RoomKey::parse(&s);
    }

    #[test]
    fn non_blank_bodies_within_limit_validate(body in "[a-z]{1,64}") {
        prop_assert!(validate_body(&body, 64).is_ok());
    }
}
