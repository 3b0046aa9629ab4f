use super::fixtures::{ArchiveBuilder, PickleWriter, TensorSpec, f32_bytes, state_dict_archive};
use crate::pytorch::{PytorchReader, load_object_graph};
use crate::{DecodedValue, Error};

#[test]
fn loads_state_dict_from_file() {
    let data = state_dict_archive(&[
        ("lin1.weight", &[1, 5], &[0.1, 0.2, 0.3, 0.4, 0.5]),
        ("lin2.weight", &[2, 1], &[2.0, -1.0]),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.pt");
    std::fs::write(&path, &data).unwrap();

    let root = load_object_graph(&path).unwrap();
    let dict = root.as_dict().unwrap();
    assert_eq!(dict.len(), 2);

    let weight = dict.get_str("lin1.weight").and_then(DecodedValue::as_tensor).unwrap();
    assert_eq!(weight.shape(), &[1, 5]);
    assert_eq!(
        weight.to_vec::<f32>().unwrap(),
        vec![0.1, 0.2, 0.3, 0.4, 0.5]
    );
    let weight = dict.get_str("lin2.weight").and_then(DecodedValue::as_tensor).unwrap();
    assert_eq!(weight.to_vec::<f32>().unwrap(), vec![2.0, -1.0]);
}

#[test]
fn decoding_is_idempotent() {
    let data = state_dict_archive(&[
        ("a", &[2, 2], &[1.0, 2.0, 3.0, 4.0]),
        ("b", &[], &[9.0]),
    ]);
    let reader = PytorchReader::from_bytes(data).unwrap();

    let first = reader.object_graph().unwrap();
    let second = reader.object_graph().unwrap();
    assert_eq!(first, second);
}

#[test]
fn tensors_share_one_storage() {
    // Two views over the same six-element storage: rows 0 and 1 of a 2x3 matrix.
    let mut w = PickleWriter::new();
    let row = |offset| TensorSpec {
        offset,
        numel: 6,
        ..TensorSpec::f32("0", &[3])
    };
    w.ordered_dict(|w| {
        w.str("row0").tensor(&row(0));
        w.str("row1").tensor(&row(3));
    });
    let data = ArchiveBuilder::new("archive")
        .pickle(w.finish())
        .storage("0", f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]))
        .build();

    let tensors = PytorchReader::from_bytes(data).unwrap().tensors(None).unwrap();
    assert_eq!(tensors["row0"].to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0]);
    assert_eq!(tensors["row1"].to_vec::<f32>().unwrap(), vec![3.0, 4.0, 5.0]);
}

#[test]
fn corrupted_stride_fails_to_load() {
    let mut w = PickleWriter::new();
    w.ordered_dict(|w| {
        let spec = TensorSpec {
            stride: vec![4, 1],
            ..TensorSpec::f32("0", &[2, 3])
        };
        w.str("weight").tensor(&spec);
    });
    let data = ArchiveBuilder::new("archive")
        .pickle(w.finish())
        .storage("0", f32_bytes(&[0.0; 6]))
        .build();

    let result = PytorchReader::from_bytes(data).unwrap().object_graph();
    assert!(matches!(result, Err(Error::CorruptTensor { .. })));
}

#[test]
fn missing_storage_fails_to_load() {
    let mut w = PickleWriter::new();
    w.ordered_dict(|w| {
        w.str("weight").tensor(&TensorSpec::f32("3", &[2]));
    });
    let data = ArchiveBuilder::new("archive").pickle(w.finish()).build();

    let result = PytorchReader::from_bytes(data).unwrap().object_graph();
    assert!(matches!(result, Err(Error::StorageNotFound { key }) if key == "3"));
}

#[test]
fn nested_checkpoint_with_top_level_key() {
    let mut w = PickleWriter::new();
    w.dict(|w| {
        w.str("epoch").int(3);
        w.str("model").ordered_dict(|w| {
            w.str("encoder").ordered_dict(|w| {
                w.str("weight").tensor(&TensorSpec::f32("0", &[2]));
            });
        });
    });
    let data = ArchiveBuilder::new("checkpoint")
        .pickle(w.finish())
        .storage("0", f32_bytes(&[1.0, 2.0]))
        .build();
    let reader = PytorchReader::from_bytes(data).unwrap();

    let tensors = reader.tensors(Some("model")).unwrap();
    assert_eq!(tensors.keys().collect::<Vec<_>>(), vec!["encoder.weight"]);

    assert!(matches!(
        reader.tensors(Some("optimizer")),
        Err(Error::UnsupportedFormat { .. })
    ));
}
