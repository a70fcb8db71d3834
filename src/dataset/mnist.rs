use burn::data::dataset::{
    transform::Mapper,
    vision::{MnistDataset, MnistItem},
    Dataset,
};

use super::{ImageItem, Split};

const WIDTH: usize = 28;
const HEIGHT: usize = 28;

/// Converts the framework's MNIST items (2D float arrays) to [`ImageItem`]s.
pub struct MnistToImage;

impl Mapper<MnistItem, ImageItem> for MnistToImage {
    fn map(&self, item: &MnistItem) -> ImageItem {
        let image = item
            .image
            .iter()
            .flat_map(|row| row.iter())
            .map(|pixel| pixel.clamp(0.0, 255.0) as u8)
            .collect();

        ImageItem {
            image,
            shape: [1, HEIGHT, WIDTH],
            label: item.label as usize,
        }
    }
}

/// All MNIST items of `split`, downloaded by the framework on first use.
pub fn mnist_items(split: Split) -> Vec<ImageItem> {
    let dataset = match split {
        Split::Train => MnistDataset::train(),
        Split::Test => MnistDataset::test(),
    };

    dataset.iter().map(|item| MnistToImage.map(&item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnist_items_are_flattened_row_major() {
        let mut image = [[0f32; WIDTH]; HEIGHT];
        image[0][1] = 255.0;
        image[1][0] = 17.0;
        let item = MnistItem { image, label: 7 };

        let mapped = MnistToImage.map(&item);

        assert_eq!(mapped.shape, [1, 28, 28]);
        assert_eq!(mapped.label, 7);
        assert_eq!(mapped.image.len(), 784);
        assert_eq!(mapped.image[1], 255);
        assert_eq!(mapped.image[28], 17);
    }
}
