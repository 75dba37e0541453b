use std::path::PathBuf;

use burn::backend::NdArray;
use digit_transfer::model::{ExtractorConfig, WeightSource};

type Backend = NdArray<f32>;

/// Written by `tests/fixtures/write_vgg16_checkpoint.py`: the k-th convolution
/// of `features` has every weight equal to `k + 1` and every bias to `-(k + 1)`.
fn checkpoint() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/vgg16_base1.pt")
}

#[test]
fn torchvision_features_land_on_matching_convolutions() {
    let device = Default::default();
    let model = ExtractorConfig::new()
        .with_base_channels(1)
        .init::<Backend>(&device)
        .unwrap();

    let model = WeightSource::PyTorch(checkpoint())
        .load_into(model, &device)
        .expect("Should decode state successfully");

    let mut convs = 0;
    for (index, conv) in model.convs().enumerate() {
        let expected = (index + 1) as f32;
        let weight = conv.weight.val().into_data().to_vec::<f32>().unwrap();
        let bias = conv
            .bias
            .as_ref()
            .map(|bias| bias.val().into_data().to_vec::<f32>().unwrap())
            .unwrap();

        assert!(
            weight.iter().all(|value| *value == expected),
            "conv {index} weight"
        );
        assert!(bias.iter().all(|value| *value == -expected), "conv {index} bias");
        convs += 1;
    }

    assert_eq!(convs, 13);
    let last = model.convs().last().unwrap();
    assert_eq!(last.weight.val().dims(), [8, 8, 3, 3]);
}
