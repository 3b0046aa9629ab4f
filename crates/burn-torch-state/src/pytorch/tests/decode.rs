use super::fixtures::{PickleWriter, TensorSpec};
use crate::pytorch::opcode::OpCode;
use crate::pytorch::pickle_reader::decode;
use crate::{DType, DecodedValue, Error};

#[test]
fn decodes_scalars() {
    let mut w = PickleWriter::new();
    w.tuple(|w| {
        w.int(7)
            .int(300)
            .int(-5)
            .int(1 << 40)
            .int(-(1 << 40))
            .float(0.001)
            .bool(true)
            .none()
            .str("β");
    });
    let value = decode(&w.finish()).unwrap();

    assert_eq!(
        value,
        DecodedValue::Tuple(vec![
            DecodedValue::Int(7),
            DecodedValue::Int(300),
            DecodedValue::Int(-5),
            DecodedValue::Int(1 << 40),
            DecodedValue::Int(-(1 << 40)),
            DecodedValue::Float(0.001),
            DecodedValue::Bool(true),
            DecodedValue::None,
            DecodedValue::String("β".into()),
        ])
    );
}

#[test]
fn decodes_text_arguments() {
    // Protocol 0 style: INT, FLOAT and PUT/GET carry newline-terminated text.
    let mut w = PickleWriter::new();
    w.op(OpCode::Mark)
        .op(OpCode::Int)
        .raw(b"42\n")
        .op(OpCode::Int)
        .raw(b"01\n")
        .op(OpCode::Float)
        .raw(b"2.5\n")
        .op(OpCode::Put)
        .raw(b"9\n")
        .op(OpCode::Get)
        .raw(b"9\n")
        .op(OpCode::Tuple);
    let value = decode(&w.finish()).unwrap();

    assert_eq!(
        value,
        DecodedValue::Tuple(vec![
            DecodedValue::Int(42),
            DecodedValue::Bool(true),
            DecodedValue::Float(2.5),
            DecodedValue::Float(2.5),
        ])
    );
}

#[test]
fn long_integers_are_sign_extended() {
    let mut w = PickleWriter::new();
    // LONG1 with two bytes: 0xff7f = -129
    w.op(OpCode::Long1).byte(2).raw(&[0x7f, 0xff]);
    assert_eq!(decode(&w.finish()).unwrap(), DecodedValue::Int(-129));

    // Nine bytes whose top byte is only sign extension still fits.
    let mut w = PickleWriter::new();
    w.op(OpCode::Long1).byte(9).raw(&[0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    assert_eq!(decode(&w.finish()).unwrap(), DecodedValue::Int(-2));

    let mut w = PickleWriter::new();
    w.op(OpCode::Long1).byte(9).raw(&[0, 0, 0, 0, 0, 0, 0, 0, 1]);
    assert!(matches!(decode(&w.finish()), Err(Error::InvalidData { .. })));
}

#[test]
fn state_dict_keeps_order_and_metadata() {
    let mut w = PickleWriter::new();
    w.ordered_dict(|w| {
        w.str("weight").tensor(&TensorSpec::f32("0", &[2, 3]));
        w.str("bias").tensor(&TensorSpec::f32("1", &[2]));
    });
    // state_dict() attaches `_metadata` as an instance attribute.
    w.dict(|w| {
        w.str("_metadata").ordered_dict(|w| {
            w.str("").dict(|w| {
                w.str("version").int(1);
            });
        });
    })
    .op(OpCode::Build);
    let value = decode(&w.finish()).unwrap();

    let dict = value.as_dict().unwrap();
    let keys: Vec<_> = dict.keys().filter_map(DecodedValue::as_str).collect();
    assert_eq!(keys, vec!["weight", "bias"]);
    assert!(dict.get_str("_metadata").is_none());
    let metadata = dict.attribute("_metadata").and_then(DecodedValue::as_dict).unwrap();
    assert_eq!(metadata.len(), 1);

    match dict.get_str("weight") {
        Some(DecodedValue::TensorRef(descriptor)) => {
            assert_eq!(descriptor.dtype, DType::F32);
            assert_eq!(descriptor.shape, vec![2, 3]);
            assert_eq!(descriptor.stride, vec![3, 1]);
            assert_eq!(descriptor.storage.key, "0");
            assert_eq!(descriptor.storage.num_elements, 6);
            assert!(!descriptor.requires_grad);
        }
        other => panic!("expected a tensor, found {other:?}"),
    }
}

#[test]
fn mutation_after_memoization_is_shared() {
    let mut w = PickleWriter::new();
    w.op(OpCode::EmptyDict).op(OpCode::Mark).str("a").op(OpCode::EmptyList);
    let list = w.put();
    w.str("b").get(list).op(OpCode::SetItems);
    // Fill the list only after both keys reference it.
    w.get(list).int(7).op(OpCode::Append).op(OpCode::Pop);
    let value = decode(&w.finish()).unwrap();

    let dict = value.as_dict().unwrap();
    let expected = DecodedValue::List(vec![DecodedValue::Int(7)]);
    assert_eq!(dict.get_str("a"), Some(&expected));
    assert_eq!(dict.get_str("b"), Some(&expected));
}

#[test]
fn integer_keys_are_preserved() {
    let mut w = PickleWriter::new();
    w.dict(|w| {
        w.int(0).str("first");
        w.int(1).str("second");
    });
    let value = decode(&w.finish()).unwrap();

    let dict = value.as_dict().unwrap();
    assert_eq!(dict.get_int(1).and_then(DecodedValue::as_str), Some("second"));
    assert!(dict.get_str("1").is_none());
}

#[test]
fn parameters_and_tensor_subclasses() {
    let mut w = PickleWriter::new();
    w.tuple(|w| {
        w.call("torch._utils", "_rebuild_parameter", |w| {
            w.tensor(&TensorSpec::f32("0", &[4])).bool(true).ordered_dict(|_| {});
        });
        w.call("torch._tensor", "_rebuild_from_type_v2", |w| {
            w.global("torch._utils", "_rebuild_tensor_v2");
            w.global("torch.nn.parameter", "Parameter");
            w.tuple(|w| {
                w.tuple(|w| {
                    w.str("storage")
                        .global("torch", "LongStorage")
                        .str("1")
                        .str("cpu")
                        .int(1);
                })
                .op(OpCode::BinPersId)
                .int(0)
                .ints(&[])
                .ints(&[])
                .bool(false)
                .ordered_dict(|_| {});
            });
            w.dict(|_| {});
        });
    });
    let value = decode(&w.finish()).unwrap();

    let items = value.as_sequence().unwrap();
    match &items[0] {
        DecodedValue::TensorRef(descriptor) => assert!(descriptor.requires_grad),
        other => panic!("expected a tensor, found {other:?}"),
    }
    match &items[1] {
        DecodedValue::TensorRef(descriptor) => {
            assert_eq!(descriptor.dtype, DType::I64);
            assert!(descriptor.shape.is_empty());
        }
        other => panic!("expected a tensor, found {other:?}"),
    }
}

#[test]
fn bytes_and_sets() {
    let mut w = PickleWriter::new();
    w.tuple(|w| {
        w.call("_codecs", "encode", |w| {
            w.str("\u{00ff}\u{0001}").str("latin1");
        });
        w.call("builtins", "set", |w| {
            w.list(|w| {
                w.int(3);
            });
        });
        w.op(OpCode::ShortBinBytes).byte(2).raw(b"ab");
    });
    let value = decode(&w.finish()).unwrap();

    assert_eq!(
        value,
        DecodedValue::Tuple(vec![
            DecodedValue::Bytes(vec![0xff, 0x01]),
            DecodedValue::List(vec![DecodedValue::Int(3)]),
            DecodedValue::Bytes(b"ab".to_vec()),
        ])
    );
}

#[test]
fn unknown_globals_are_rejected() {
    let mut w = PickleWriter::new();
    w.call("os", "system", |w| {
        w.str("echo pwned");
    });

    match decode(&w.finish()) {
        // The GLOBAL opcode directly follows the 2-byte PROTO header.
        Err(Error::UnsupportedGlobal { name, offset }) => {
            assert_eq!(name, "os.system");
            assert_eq!(offset, 2);
        }
        other => panic!("expected UnsupportedGlobal, found {other:?}"),
    }
}

#[test]
fn storage_classes_cannot_be_called() {
    let mut w = PickleWriter::new();
    w.call("torch", "FloatStorage", |w| {
        w.int(10);
    });
    assert!(matches!(decode(&w.finish()), Err(Error::InvalidData { .. })));
}

#[test]
fn unsupported_opcode_reports_offset() {
    let mut w = PickleWriter::new();
    w.none().raw(b"P0\n");
    assert!(matches!(
        decode(&w.finish()),
        Err(Error::UnsupportedOpcode {
            opcode: b'P',
            offset: 3
        })
    ));
}

#[test]
fn truncated_streams() {
    let mut w = PickleWriter::new();
    w.ordered_dict(|w| {
        w.str("weight").tensor(&TensorSpec::f32("0", &[2, 3]));
    });
    let data = w.finish();

    // Cut inside the stream and right before STOP.
    for len in [data.len() / 2, data.len() - 1] {
        assert!(
            matches!(decode(&data[..len]), Err(Error::TruncatedStream { .. })),
            "length {len}"
        );
    }

    // A string whose declared length runs past the end.
    let mut w = PickleWriter::new();
    w.op(OpCode::BinUnicode).raw(&100u32.to_le_bytes()).raw(b"abc");
    assert!(matches!(
        decode(&w.finish()),
        Err(Error::TruncatedStream { offset: 7 })
    ));
}

#[test]
fn missing_memo_entry() {
    let mut w = PickleWriter::new();
    w.get(3);
    assert!(matches!(
        decode(&w.finish()),
        Err(Error::MemoNotFound { index: 3, offset: 2 })
    ));
}

#[test]
fn malformed_stack_operations() {
    // APPEND with nothing on the stack.
    let mut w = PickleWriter::new();
    w.op(OpCode::Append);
    assert!(matches!(decode(&w.finish()), Err(Error::InvalidData { .. })));

    // TUPLE without a MARK.
    let mut w = PickleWriter::new();
    w.int(1).op(OpCode::Tuple);
    assert!(matches!(decode(&w.finish()), Err(Error::InvalidData { .. })));

    // SETITEM on a list.
    let mut w = PickleWriter::new();
    w.op(OpCode::EmptyList).int(1).int(2).op(OpCode::SetItem);
    assert!(matches!(decode(&w.finish()), Err(Error::InvalidData { .. })));
}

#[test]
fn self_referencing_list_is_rejected() {
    let mut w = PickleWriter::new();
    w.op(OpCode::EmptyList);
    let list = w.put();
    w.get(list).op(OpCode::Append);
    assert!(matches!(decode(&w.finish()), Err(Error::InvalidData { .. })));
}

#[test]
fn newer_protocols_are_rejected() {
    let data = [OpCode::Proto as u8, 6, OpCode::None as u8, OpCode::Stop as u8];
    assert!(matches!(decode(&data), Err(Error::InvalidData { .. })));
}

#[test]
fn protocol_4_framing_and_memoize() {
    let mut data = vec![OpCode::Proto as u8, 4, OpCode::Frame as u8];
    data.extend_from_slice(&8u64.to_le_bytes());
    data.extend_from_slice(&[
        OpCode::ShortBinUnicode as u8,
        1,
        b'x',
        OpCode::Memoize as u8,
        OpCode::Pop as u8,
        OpCode::BinGet as u8,
        0,
        OpCode::Stop as u8,
    ]);
    assert_eq!(decode(&data).unwrap(), DecodedValue::String("x".into()));
}
