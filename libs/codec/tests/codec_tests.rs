//! Codec integration tests: public API round-trips through `dyn Codec`

use bytes::Bytes;
use codec::{BinaryCodec, Codec, CodecError, Message, MessageId, Properties};
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

fn roundtrip(codec: &dyn Codec, message: &Message) -> Message {
    let encoded = codec.encode(message).expect("encode");
    codec.decode(encoded.data()).expect("decode")
}

#[test]
fn test_every_identifier_variant_roundtrips() {
    let codec = BinaryCodec::new();
    let variants = vec![
        MessageId::String("id-1".to_string()),
        MessageId::Ulong(u64::MAX),
        MessageId::Binary(Bytes::from_static(&[0, 1, 2, 255])),
        MessageId::Uuid(Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0)),
    ];

    for message_id in &variants {
        for correlation_id in &variants {
            let message = Message::new("payload")
                .with_message_id(message_id.clone())
                .with_correlation_id(correlation_id.clone());
            let decoded = roundtrip(&codec, &message);

            assert_eq!(decoded, message);
            assert_eq!(
                decoded.properties().message_id().map(MessageId::variant_name),
                Some(message_id.variant_name())
            );
        }
    }
}

#[test]
fn test_wrong_variant_read_after_decode() {
    let codec = BinaryCodec::new();
    let message = Message::new("x").with_message_id(MessageId::Ulong(5));
    let decoded = roundtrip(&codec, &message);

    let id = decoded.properties().message_id().unwrap();
    assert_eq!(id.as_u64().unwrap(), 5);
    assert!(matches!(id.as_str(), Err(CodecError::WrongVariant { .. })));
}

#[test]
fn test_concurrent_use_from_many_threads() {
    let codec: Arc<dyn Codec> = Arc::new(BinaryCodec::new());
    let handles: Vec<_> = (0..8u64)
        .map(|n| {
            let codec = Arc::clone(&codec);
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    let message = Message::new(format!("body-{n}-{i}")).with_message_id(i);
                    assert_eq!(roundtrip(codec.as_ref(), &message), message);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_decode_rejects_garbage() {
    let codec = BinaryCodec::new();
    for garbage in [&[][..], &[0, 0, 0, 1][..], &[0, 0, 0, 1, 0x42][..], &[0xFF; 12][..]] {
        let err = codec.decode(garbage).unwrap_err();
        assert!(err.is_decoding(), "expected decoding error, got {err:?}");
    }
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    prop_oneof![
        ".{0,32}".prop_map(MessageId::String),
        any::<u64>().prop_map(MessageId::Ulong),
        proptest::collection::vec(any::<u8>(), 0..32).prop_map(|v| MessageId::Binary(Bytes::from(v))),
        any::<u128>().prop_map(|n| MessageId::Uuid(Uuid::from_u128(n))),
    ]
}

proptest! {
    #[test]
    fn prop_roundtrip_preserves_message(
        body in proptest::collection::vec(any::<u8>(), 0..256),
        message_id in proptest::option::of(arb_message_id()),
        correlation_id in proptest::option::of(arb_message_id()),
        subject in proptest::option::of(".{0,16}"),
        creation_time in proptest::option::of(any::<i64>()),
        group_sequence in proptest::option::of(any::<u32>()),
    ) {
        let codec = BinaryCodec::new();
        let message = Message::new(body).with_properties(Properties {
            message_id,
            correlation_id,
            subject,
            creation_time,
            group_sequence,
            ..Properties::default()
        });

        let encoded = codec.encode(&message).unwrap();
        prop_assert_eq!(encoded.size(), encoded.data().len());
        prop_assert_eq!(codec.decode(encoded.data()).unwrap(), message);
    }
}
