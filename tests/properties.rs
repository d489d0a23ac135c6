use proptest::prelude::*;
use serde_json::{Value, json};

use stepgraph::channels::ChannelSpec;
use stepgraph::checkpoint::serializer::{JsonPlusSerializer, Serializer, tag_bytes};
use stepgraph::types::{checkpoint_uuid, task_uuid};

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _-]{0,24}".prop_map(Value::from),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,8}", inner), 0..6).prop_map(|entries| {
                Value::Object(entries.into_iter().collect())
            }),
        ]
    })
}

proptest! {
    #[test]
    fn serializer_roundtrips_arbitrary_json(value in arb_json()) {
        let ser = JsonPlusSerializer;
        let bytes = ser.dumps(&value).unwrap();
        prop_assert_eq!(ser.loads(&bytes).unwrap(), value);
    }

    #[test]
    fn serializer_roundtrips_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let ser = JsonPlusSerializer;
        let tagged = tag_bytes(&data);
        let (kind, raw) = ser.dumps_typed(&tagged).unwrap();
        prop_assert_eq!(kind, "bytes");
        prop_assert_eq!(&raw, &data);
        prop_assert_eq!(ser.loads_typed(kind, &raw).unwrap(), tagged);
    }

    #[test]
    fn checkpoint_ids_are_monotonic_for_any_step_sequence(steps in prop::collection::vec(-1i64..64, 1..24)) {
        let ids: Vec<String> = steps.iter().map(|s| checkpoint_uuid(*s).to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        prop_assert_eq!(ids, sorted);
    }

    #[test]
    fn task_ids_depend_on_every_input(
        step in -1i64..128,
        index in 0usize..32,
        node in "[a-z]{1,12}",
    ) {
        let base = task_uuid("ckpt", "ns", step, index, &node);
        prop_assert_eq!(base, task_uuid("ckpt", "ns", step, index, &node));
        prop_assert_ne!(base, task_uuid("ckpt", "ns", step + 1, index, &node));
        prop_assert_ne!(base, task_uuid("ckpt", "ns", step, index + 1, &node));
        prop_assert_ne!(base, task_uuid("other", "ns", step, index, &node));
    }

    #[test]
    fn topic_accumulation_preserves_order(batches in prop::collection::vec(prop::collection::vec(0i64..100, 0..5), 0..6)) {
        let mut topic = ChannelSpec::topic(false, true).build("log", None).unwrap();
        let mut expected = Vec::new();
        for batch in &batches {
            let writes: Vec<Value> = batch.iter().map(|n| json!(n)).collect();
            expected.extend(writes.clone());
            topic.update(writes).unwrap();
        }
        if expected.is_empty() {
            prop_assert!(!topic.is_available());
        } else {
            prop_assert_eq!(topic.get().unwrap(), Value::Array(expected));
        }
    }

    #[test]
    fn last_value_always_keeps_the_newest(values in prop::collection::vec(any::<i64>(), 1..20)) {
        let mut ch = ChannelSpec::last_value().build("x", None).unwrap();
        for v in &values {
            ch.update(vec![json!(v)]).unwrap();
        }
        prop_assert_eq!(ch.get().unwrap(), json!(values.last().unwrap()));
    }
}
