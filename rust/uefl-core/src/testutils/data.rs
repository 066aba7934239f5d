//! Synthetic IDX datasets and silo data.

use crate::data::{IdxArray, SiloData, NUM_CLASSES};

/// Generates IDX images and labels for a training split of `n_train` and a test split of
/// `n_test` records of `height × width` pixels.
///
/// The label of a record is `record % 10`. The pixels follow a pattern without rotational
/// symmetry.
pub fn idx_dataset(
    n_train: usize,
    n_test: usize,
    height: usize,
    width: usize,
) -> (IdxArray, IdxArray, IdxArray, IdxArray) {
    let (train_images, train_labels) = idx_split(n_train, height, width);
    let (test_images, test_labels) = idx_split(n_test, height, width);
    (train_images, train_labels, test_images, test_labels)
}

fn idx_split(n: usize, height: usize, width: usize) -> (IdxArray, IdxArray) {
    let size = height * width;
    let images = IdxArray {
        dims: vec![n, height, width],
        data: (0..n * size)
            .map(|i| {
                let (record, pixel) = (i / size, i % size);
                ((record * 7 + pixel * pixel * 13) % 256) as u8
            })
            .collect(),
    };
    let labels = IdxArray {
        dims: vec![n],
        data: (0..n).map(|i| (i % NUM_CLASSES) as u8).collect(),
    };
    (images, labels)
}

/// Generates `n` images of `height × width` pixels, whose class can be read off the image: the
/// pixels of an image of class `c` are bright in column `c % width` and dark elsewhere.
pub fn separable_silo_data(n: usize, height: usize, width: usize) -> SiloData {
    let mut images = Vec::with_capacity(n * height * width);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let label = i % NUM_CLASSES;
        for _ in 0..height {
            for x in 0..width {
                images.push(if x == label % width { 1. } else { 0. });
            }
        }
        labels.push(label as u32);
    }
    SiloData {
        images,
        labels,
        height,
        width,
    }
}
