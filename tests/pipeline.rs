use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    data::dataloader::batcher::Batcher,
    optim::AdamConfig,
    prelude::*,
};
use vision_export::{
    data::{ImageBatch, ImageBatcher, PreprocessConfig},
    dataset::{ImageItem, Splits, ValidationSplit},
    export::{self, ArtifactHeader, ExportFormat},
    inference::Predictor,
    model::{Architecture, Classifier, LeNet, LeNetConfig},
    training::{self, TrainingConfig},
};

type B = NdArray<f32>;
type TrainingBackend = Autodiff<B>;

/// A 28x28 digit whose brightness depends on its label.
fn digit(label: usize, seed: usize) -> ImageItem {
    let image = (0..28 * 28)
        .map(|i| ((i * (label + 1) + seed * 7) % 256) as u8)
        .collect();

    ImageItem {
        image,
        shape: [1, 28, 28],
        label,
    }
}

fn digits(count: usize) -> Vec<ImageItem> {
    (0..count).map(|i| digit(i % 10, i)).collect()
}

fn lenet_header() -> ArtifactHeader {
    let preprocess = PreprocessConfig::new().with_padding(2);
    let config = LeNetConfig::new();

    ArtifactHeader {
        topology: config
            .topology(preprocess.output_shape([1, 28, 28]).unwrap())
            .unwrap(),
        architecture: Architecture::LeNet(config),
        preprocess,
    }
}

fn probabilities(model: &LeNet<B>, items: Vec<ImageItem>) -> Vec<f32> {
    let batcher = ImageBatcher::new(PreprocessConfig::new().with_padding(2), [1, 28, 28]).unwrap();
    let batch: ImageBatch<B> = batcher.batch(items, &Default::default());

    model
        .probabilities(batch.images)
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

fn assert_close(lhs: &[f32], rhs: &[f32], tolerance: f32) {
    assert_eq!(lhs.len(), rhs.len());
    for (l, r) in lhs.iter().zip(rhs) {
        assert!((l - r).abs() <= tolerance, "{l} != {r}");
    }
}

#[test]
fn lenet_trains_on_synthetic_digits_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let device = NdArrayDevice::Cpu;

    let splits =
        Splits::from_items(digits(24), digits(6), &ValidationSplit::Holdout(6), None).unwrap();
    let batcher = ImageBatcher::new(PreprocessConfig::new().with_padding(2), [1, 28, 28]).unwrap();
    let config = TrainingConfig::new(AdamConfig::new())
        .with_num_epochs(2)
        .with_batch_size(6)
        .with_num_workers(1)
        .with_restore_best(true)
        .with_dashboard(false);

    let model = training::train::<TrainingBackend, _>(
        LeNetConfig::new().init::<TrainingBackend>(&device),
        batcher.clone(),
        splits.train,
        splits.valid,
        &config,
        dir.path(),
        device.clone(),
    )
    .unwrap();

    assert!(dir.path().join("config.json").is_file());
    assert!(!training::checkpoints(dir.path()).unwrap().is_empty());

    let evaluation = training::evaluate::<B, _, _>(&model, &batcher, &splits.test, 4, &device).unwrap();
    assert_eq!(evaluation.items, 6);
    assert!(evaluation.loss.is_finite());

    let paths = export::export(
        model,
        &lenet_header(),
        dir.path(),
        "mnist_lenet",
        ExportFormat::Split,
    )
    .unwrap();

    assert_eq!(paths.len(), 2);
    for path in paths {
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}

#[test]
fn full_precision_exports_reproduce_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model: LeNet<B> = LeNetConfig::new().init(&device);
    let expected = probabilities(&model, digits(3));

    for (format, artifact) in [
        (ExportFormat::Split, "lenet.json"),
        (ExportFormat::Combined, "lenet.vxm"),
    ] {
        export::export(model.clone(), &lenet_header(), dir.path(), "lenet", format).unwrap();

        let (header, loaded) = export::load::<B>(&dir.path().join(artifact), &device).unwrap();
        let batcher = ImageBatcher::new(header.preprocess.clone(), [1, 28, 28]).unwrap();
        let batch: ImageBatch<B> = batcher.batch(digits(3), &device);
        let actual = loaded.probabilities(batch.images);

        assert_eq!(header.topology, lenet_header().topology);
        assert_close(&actual.into_data().to_vec::<f32>().unwrap(), &expected, 1e-5);
    }
}

#[test]
fn web_export_writes_a_manifest_and_a_half_precision_shard() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model: LeNet<B> = LeNetConfig::new().init(&device);
    let items = digits(4);
    let expected = probabilities(&model, items.clone());

    let paths = export::export(model, &lenet_header(), dir.path(), "lenet", ExportFormat::Web)
        .unwrap();

    let web_dir = dir.path().join("lenet_web");
    assert_eq!(paths[0], web_dir.join("model.json"));
    let manifest: export::WebManifest =
        serde_json::from_slice(&std::fs::read(&paths[0]).unwrap()).unwrap();
    let shard = std::fs::metadata(&paths[1]).unwrap().len() as usize;
    assert_eq!(manifest.weights[0].bytes, shard);
    assert_eq!(manifest.precision, "f16");

    let predictor = Predictor::<B>::load(&web_dir, &device).unwrap();
    for (i, item) in items.iter().enumerate() {
        let prediction = predictor.predict(item).unwrap();

        assert_close(&prediction.probabilities, &expected[i * 10..(i + 1) * 10], 1e-2);
        let sum: f32 = prediction.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }
}

#[test]
fn corrupt_combined_artifacts_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.vxm");
    std::fs::write(&path, b"VXMODEL\0\x01\x00\x00\x00\xff\xff\x00\x00{").unwrap();

    let result = export::load::<B>(&path, &Default::default());

    assert!(matches!(result, Err(vision_export::Error::Format(_))));
}

#[test]
fn predictor_rejects_images_of_another_shape() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model: LeNet<B> = LeNetConfig::new().init(&device);
    export::export(model, &lenet_header(), dir.path(), "lenet", ExportFormat::Combined).unwrap();
    let predictor = Predictor::<B>::load(&dir.path().join("lenet.vxm"), &device).unwrap();

    let colour = ImageItem {
        image: vec![0; 3 * 32 * 32],
        shape: [3, 32, 32],
        label: 0,
    };

    assert!(predictor.predict(&colour).is_err());
    assert_eq!(predictor.header().topology.input_shape, [1, 32, 32]);
}
