use base64::Engine as _;
use protofuzz::codec::{FieldMap, FieldValue, ProtocolCodec};
use protofuzz::plugin::{Block, BlockType, DataModel, SizeOf};
use protofuzz::session::context::{ContextStore, ContextValue};

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// The SimpleTCP layout: magic, auto-computed length, command enum,
/// variable payload.
fn simple_tcp_model() -> DataModel {
    let mut magic = Block::new("magic", BlockType::Bytes);
    magic.size = Some(4);
    magic.default = Some(serde_json::Value::String(b64(b"STCP")));
    magic.mutable = false;

    let mut length = Block::new("length", BlockType::Uint32);
    length.is_size_field = true;
    length.size_of = Some(SizeOf::One("payload".into()));

    let mut command = Block::new("command", BlockType::Uint8);
    command.values = Some(
        [
            (1u64, "AUTH".to_string()),
            (2, "DATA".to_string()),
            (3, "QUIT".to_string()),
        ]
        .into_iter()
        .collect(),
    );

    let mut payload = Block::new("payload", BlockType::Bytes);
    payload.max_size = Some(1024);

    DataModel {
        name: Some("SimpleTCP".into()),
        description: None,
        blocks: vec![magic, length, command, payload],
        seeds: Vec::new(),
    }
}

/// Scenario A: parsing and serializing the SimpleTCP protocol produce the
/// documented byte layouts.
#[test]
fn simple_tcp_round_trip() {
    let codec = ProtocolCodec::new(simple_tcp_model());

    let wire = [
        0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x05, 0x01, 0x48, 0x45, 0x4C, 0x4C, 0x4F,
    ];
    let fields = codec.parse(&wire).unwrap();
    assert_eq!(fields["magic"], FieldValue::Bytes(b"STCP".to_vec()));
    assert_eq!(fields["length"], FieldValue::Uint(5));
    assert_eq!(fields["command"], FieldValue::Uint(1));
    assert_eq!(fields["payload"], FieldValue::Bytes(b"HELLO".to_vec()));

    let mut request = FieldMap::new();
    request.insert("command".into(), FieldValue::Uint(2));
    request.insert("payload".into(), FieldValue::Bytes(b"TEST".to_vec()));
    let out = codec.serialize(&request, None).unwrap();
    assert_eq!(
        out,
        [0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x04, 0x02, 0x54, 0x45, 0x53, 0x54]
    );
}

/// Scenario B: an IPv4-style header with sub-byte fields decodes to the
/// documented values and re-serializes bit-identically.
#[test]
fn ipv4_header_bit_fields() {
    let bits = |name: &str, size: usize| {
        let mut b = Block::new(name, BlockType::Bits);
        b.size = Some(size);
        b
    };
    let model = DataModel {
        name: Some("ipv4".into()),
        description: None,
        blocks: vec![
            bits("version", 4),
            bits("ihl", 4),
            bits("dscp", 6),
            bits("ecn", 2),
            Block::new("total_length", BlockType::Uint16),
            Block::new("identification", BlockType::Uint16),
            bits("flags", 3),
            bits("fragment_offset", 13),
            Block::new("ttl", BlockType::Uint8),
            Block::new("protocol", BlockType::Uint8),
            Block::new("checksum", BlockType::Uint16),
        ],
        seeds: Vec::new(),
    };
    let codec = ProtocolCodec::new(model);

    let wire = [
        0x45, 0x00, 0x00, 0x54, 0x12, 0x34, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00,
    ];
    let fields = codec.parse(&wire).unwrap();
    assert_eq!(fields["version"], FieldValue::Uint(4));
    assert_eq!(fields["ihl"], FieldValue::Uint(5));
    assert_eq!(fields["dscp"], FieldValue::Uint(0));
    assert_eq!(fields["ecn"], FieldValue::Uint(0));
    assert_eq!(fields["total_length"], FieldValue::Uint(0x54));
    assert_eq!(fields["identification"], FieldValue::Uint(0x1234));
    assert_eq!(fields["flags"], FieldValue::Uint(2));
    assert_eq!(fields["fragment_offset"], FieldValue::Uint(0));
    assert_eq!(fields["ttl"], FieldValue::Uint(0x40));
    assert_eq!(fields["protocol"], FieldValue::Uint(6));
    assert_eq!(fields["checksum"], FieldValue::Uint(0));

    assert_eq!(codec.serialize(&fields, None).unwrap(), wire);
}

/// Scenario D: `from_context` injection produces the documented bytes.
#[test]
fn from_context_injection() {
    let mut magic = Block::new("magic", BlockType::Bytes);
    magic.size = Some(4);
    magic.default = Some(serde_json::Value::String(b64(b"ORCH")));
    let mut msg_type = Block::new("msg_type", BlockType::Uint8);
    msg_type.default = Some(serde_json::json!(0x10));
    let mut length = Block::new("length", BlockType::Uint16);
    length.is_size_field = true;
    length.size_of = Some(SizeOf::One("payload".into()));
    let mut token = Block::new("token", BlockType::Uint32);
    token.from_context = Some("session_token".into());
    let mut payload = Block::new("payload", BlockType::Bytes);
    payload.max_size = Some(64);
    payload.default = Some(serde_json::Value::String(b64(b"PING")));

    let codec = ProtocolCodec::new(DataModel {
        name: None,
        description: None,
        blocks: vec![magic, msg_type, length, token, payload],
        seeds: Vec::new(),
    });

    let mut ctx = ContextStore::new();
    ctx.set("session_token", ContextValue::Uint(0xDEADBEEF));

    let out = codec.serialize(&FieldMap::new(), Some(&ctx)).unwrap();
    assert_eq!(
        out,
        [
            0x4F, 0x52, 0x43, 0x48, 0x10, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0x50, 0x49,
            0x4E, 0x47
        ]
    );
}

/// Round-trip invariant: any message produced from defaults re-parses and
/// re-serializes to identical bytes, across a spread of payload shapes.
#[test]
fn round_trip_property_over_payload_shapes() {
    let codec = ProtocolCodec::new(simple_tcp_model());
    for size in [0usize, 1, 7, 64, 255, 1024] {
        for fill in [0x00u8, 0x41, 0xFF] {
            let mut fields = FieldMap::new();
            fields.insert("command".into(), FieldValue::Uint((size % 3 + 1) as u64));
            fields.insert("payload".into(), FieldValue::Bytes(vec![fill; size]));
            let message = codec.serialize(&fields, None).unwrap();

            let reparsed = codec.parse(&message).unwrap();
            let again = codec.serialize(&reparsed, None).unwrap();
            assert_eq!(again, message, "size={size} fill={fill:#x}");
        }
    }
}

/// Length invariant: after serialization the decoded size field always
/// equals the measured target length.
#[test]
fn length_invariant_holds_after_serialize() {
    let codec = ProtocolCodec::new(simple_tcp_model());
    for size in 0usize..64 {
        let mut fields = FieldMap::new();
        fields.insert("payload".into(), FieldValue::Bytes(vec![0xA5; size]));
        // A wrong explicit length must be overwritten by the auto-fix pass.
        fields.insert("length".into(), FieldValue::Uint(9999));
        let message = codec.serialize(&fields, None).unwrap();
        let parsed = codec.parse(&message).unwrap();
        assert_eq!(parsed["length"], FieldValue::Uint(size as u64));
    }
}

/// Checksum invariant: recomputing the algorithm over the configured range
/// always matches the emitted checksum field.
#[test]
fn checksum_invariant_holds_after_serialize() {
    use protofuzz::plugin::ChecksumAlgorithm;

    for algorithm in [
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Adler32,
        ChecksumAlgorithm::Sum,
        ChecksumAlgorithm::Xor,
    ] {
        let mut header = Block::new("header", BlockType::Bytes);
        header.size = Some(4);
        header.default = Some(serde_json::Value::String(b64(b"HDRX")));
        let mut crc = Block::new("crc", BlockType::Uint32);
        crc.is_checksum = true;
        crc.checksum_algorithm = Some(algorithm);
        let mut payload = Block::new("payload", BlockType::Bytes);
        payload.max_size = Some(128);

        let codec = ProtocolCodec::new(DataModel {
            name: None,
            description: None,
            blocks: vec![header, crc, payload],
            seeds: Vec::new(),
        });

        let mut fields = FieldMap::new();
        fields.insert("payload".into(), FieldValue::Bytes(b"payload-data".to_vec()));
        let message = codec.serialize(&fields, None).unwrap();

        let mut covered = message[..4].to_vec();
        covered.extend_from_slice(&message[8..]);
        let expected = protofuzz::codec::checksum::compute(algorithm, &covered) as u32;
        let actual = u32::from_be_bytes([message[4], message[5], message[6], message[7]]);
        assert_eq!(actual, expected, "algorithm {algorithm:?}");
    }
}

/// Context byte fidelity: snapshot/restore round-trips every supported
/// value type exactly.
#[test]
fn context_snapshot_fidelity() {
    let mut ctx = ContextStore::new();
    ctx.set("token", ContextValue::Uint(0xDEAD_BEEF));
    ctx.set("delta", ContextValue::Int(-17));
    ctx.set("name", ContextValue::Str("alpha".into()));
    ctx.set("nonce", ContextValue::Bytes((0u8..=255).collect()));
    ctx.set("when", ContextValue::Timestamp(chrono::Utc::now()));
    ctx.set(
        "mixed",
        ContextValue::Array(vec![
            ContextValue::Uint(1),
            ContextValue::Bytes(vec![0, 255]),
            ContextValue::Map(
                [("k".to_string(), ContextValue::Bool(true))]
                    .into_iter()
                    .collect(),
            ),
        ]),
    );
    ctx.set_bootstrap_complete(true);

    let restored = ContextStore::restore(&ctx.snapshot());
    assert!(restored.bootstrap_complete());
    for key in ctx.keys() {
        assert_eq!(restored.get(&key), ctx.get(&key), "key {key}");
    }
}
