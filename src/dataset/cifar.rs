use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use burn::data::network::downloader::download_file_as_bytes;
use flate2::read::GzDecoder;

use super::{ImageItem, Split};
use crate::error::{Error, Result};

const URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
const ARCHIVE_DIR: &str = "cifar-10-batches-bin";
const TRAIN_BATCHES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_BATCH: &str = "test_batch.bin";

const CHANNELS: usize = 3;
const WIDTH: usize = 32;
const HEIGHT: usize = 32;
const NUM_CLASSES: usize = 10;
const IMAGE_SIZE: usize = CHANNELS * WIDTH * HEIGHT;
const RECORD_SIZE: usize = 1 + IMAGE_SIZE;

/// The CIFAR-10 dataset consists of 60,000 32x32 colour images in 10 classes, with 50,000
/// training images and 10,000 test images.
///
/// The binary distribution is downloaded once into the user cache directory. Each record
/// is a label byte followed by the red, green and blue planes of the image.
pub struct Cifar10Dataset {
    items: Vec<ImageItem>,
}

impl Dataset<ImageItem> for Cifar10Dataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl From<Cifar10Dataset> for Vec<ImageItem> {
    fn from(dataset: Cifar10Dataset) -> Self {
        dataset.items
    }
}

impl Cifar10Dataset {
    /// Creates the train split, downloading the archive if needed.
    pub fn train() -> Result<Self> {
        Self::from_dir(Self::download()?, Split::Train)
    }

    /// Creates the test split, downloading the archive if needed.
    pub fn test() -> Result<Self> {
        Self::from_dir(Self::download()?, Split::Test)
    }

    /// Reads the batch files of `split` from an unpacked `cifar-10-batches-bin` directory.
    pub fn from_dir<P: AsRef<Path>>(root: P, split: Split) -> Result<Self> {
        let files: &[&str] = match split {
            Split::Train => &TRAIN_BATCHES,
            Split::Test => &[TEST_BATCH],
        };

        let mut items = Vec::new();
        for name in files {
            let path = root.as_ref().join(name);
            let bytes = fs::read(&path).map_err(|err| {
                Error::Dataset(format!("Could not read {}: {err}", path.display()))
            })?;
            items.extend(parse_batch(&bytes)?);
        }

        Ok(Self { items })
    }

    /// Download and unpack the binary archive into the cache directory.
    fn download() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| Error::Dataset("Could not get cache directory".to_string()))?
            .join("vision-export")
            .join("cifar10");
        let batches_dir = cache_dir.join(ARCHIVE_DIR);

        if batches_dir.join(TEST_BATCH).exists() {
            return Ok(batches_dir);
        }

        create_dir_all(&cache_dir)?;
        log::info!("Downloading CIFAR-10 into {}", cache_dir.display());

        let bytes = download_file_as_bytes(URL, "cifar-10-binary.tar.gz");
        let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
        archive.unpack(&cache_dir)?;

        Ok(batches_dir)
    }
}

/// Decode the records of one binary batch file.
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<ImageItem>> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(Error::Dataset(format!(
            "CIFAR-10 batch of {} bytes is not a whole number of {RECORD_SIZE}-byte records",
            bytes.len()
        )));
    }

    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|record| {
            let label = record[0] as usize;
            if label >= NUM_CLASSES {
                return Err(Error::Dataset(format!("Invalid CIFAR-10 label {label}")));
            }

            Ok(ImageItem {
                image: record[1..].to_vec(),
                shape: [CHANNELS, HEIGHT, WIDTH],
                label,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: u8, red: u8, green: u8, blue: u8) -> Vec<u8> {
        let plane = WIDTH * HEIGHT;
        let mut bytes = vec![label];
        bytes.extend(std::iter::repeat(red).take(plane));
        bytes.extend(std::iter::repeat(green).take(plane));
        bytes.extend(std::iter::repeat(blue).take(plane));
        bytes
    }

    #[test]
    fn records_are_decoded_as_channel_planes() {
        let mut bytes = record(3, 10, 20, 30);
        bytes.extend(record(9, 1, 2, 3));

        let items = parse_batch(&bytes).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label, 3);
        assert_eq!(items[0].shape, [3, 32, 32]);
        assert_eq!(items[0].image[0], 10);
        assert_eq!(items[0].image[1024], 20);
        assert_eq!(items[0].image[2048], 30);
        assert_eq!(items[1].label, 9);
    }

    #[test]
    fn truncated_batches_are_rejected() {
        let mut bytes = record(1, 0, 0, 0);
        bytes.pop();

        assert!(matches!(parse_batch(&bytes), Err(Error::Dataset(_))));
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let bytes = record(10, 0, 0, 0);

        assert!(matches!(parse_batch(&bytes), Err(Error::Dataset(_))));
    }

    #[test]
    fn splits_are_read_from_their_batch_files() {
        let dir = tempfile::tempdir().unwrap();
        for (i, name) in TRAIN_BATCHES.iter().enumerate() {
            fs::write(dir.path().join(name), record(i as u8, 0, 0, 0)).unwrap();
        }
        let mut test = record(7, 0, 0, 0);
        test.extend(record(8, 0, 0, 0));
        fs::write(dir.path().join(TEST_BATCH), test).unwrap();

        let train = Cifar10Dataset::from_dir(dir.path(), Split::Train).unwrap();
        let test = Cifar10Dataset::from_dir(dir.path(), Split::Test).unwrap();

        assert_eq!(train.len(), 5);
        assert_eq!(train.get(4).unwrap().label, 4);
        assert_eq!(test.len(), 2);
        assert_eq!(test.get(1).unwrap().label, 8);
    }

    #[test]
    fn missing_batch_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();

        let result = Cifar10Dataset::from_dir(dir.path(), Split::Test);

        assert!(matches!(result, Err(Error::Dataset(_))));
    }
}
