use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use log::info;
use ndarray::{s, Array1, Array2};
use rand::Rng;
use std::io::Read;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// One client's labeled-example container: flattened images plus labels.
#[derive(Debug, Clone)]
pub struct Partition {
    pub images: Array2<f32>,
    pub labels: Array1<i32>,
}

impl Partition {
    pub fn new(images: Array2<f32>, labels: Array1<i32>) -> Self {
        Self { images, labels }
    }

    pub fn empty(feature_dim: usize) -> Self {
        Self {
            images: Array2::zeros((0, feature_dim)),
            labels: Array1::zeros(0),
        }
    }

    pub fn num_examples(&self) -> usize {
        self.images.nrows()
    }

    pub fn feature_dim(&self) -> usize {
        self.images.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.num_examples() == 0
    }
}

/// A client's (training, evaluation) pair.
#[derive(Debug, Clone)]
pub struct ClientDataset {
    pub train: Partition,
    pub test: Partition,
}

/// IID split of a partition into `num_clients` contiguous slices; the last
/// client takes the remainder.
pub fn split_partition(data: &Partition, num_clients: usize) -> Vec<Partition> {
    if num_clients == 0 {
        return Vec::new();
    }
    let total = data.num_examples();
    let per_client = total / num_clients;

    let mut splits = Vec::with_capacity(num_clients);
    for i in 0..num_clients {
        let start = i * per_client;
        let end = if i == num_clients - 1 {
            total
        } else {
            (i + 1) * per_client
        };
        splits.push(Partition::new(
            data.images.slice(s![start..end, ..]).to_owned(),
            data.labels.slice(s![start..end]).to_owned(),
        ));
    }
    splits
}

/// Random, roughly separable classification data for simulations and tests
/// that should not touch the network. Class c is centered on feature c.
pub fn synthetic_partition(num_examples: usize, num_classes: usize, feature_dim: usize) -> Partition {
    let mut rng = rand::thread_rng();
    let mut images = Array2::zeros((num_examples, feature_dim));
    let mut labels = Array1::zeros(num_examples);
    for i in 0..num_examples {
        let class = rng.gen_range(0..num_classes);
        for j in 0..feature_dim {
            let base = if j % num_classes == class { 1.0 } else { 0.0 };
            images[[i, j]] = base + rng.gen::<f32>() * 0.1;
        }
        labels[i] = class as i32;
    }
    Partition::new(images, labels)
}

/// Per-client synthetic (train, test) pairs.
pub fn synthetic_client_datasets(
    num_clients: usize,
    examples_per_client: usize,
    num_classes: usize,
    feature_dim: usize,
) -> Vec<ClientDataset> {
    (0..num_clients)
        .map(|_| ClientDataset {
            train: synthetic_partition(examples_per_client, num_classes, feature_dim),
            test: synthetic_partition(examples_per_client / 4 + 1, num_classes, feature_dim),
        })
        .collect()
}

pub struct MnistData {
    pub train: Partition,
    pub test: Partition,
}

impl MnistData {
    pub async fn load() -> Result<Self> {
        // Prefer https mirror for reliability; fall back to Yann LeCun host if needed.
        const BASE_URLS: [&str; 2] = [
            "https://storage.googleapis.com/cvdf-datasets/mnist",
            "http://yann.lecun.com/exdb/mnist",
        ];
        const TRAIN_IMAGES: &str = "train-images-idx3-ubyte.gz";
        const TRAIN_LABELS: &str = "train-labels-idx1-ubyte.gz";
        const TEST_IMAGES: &str = "t10k-images-idx3-ubyte.gz";
        const TEST_LABELS: &str = "t10k-labels-idx1-ubyte.gz";

        let data_dir = PathBuf::from("data/mnist");
        fs::create_dir_all(&data_dir).await?;

        // Download + inflate with one automatic retry on corruption
        async fn fetch_and_inflate(urls: &[&str], filename: &str, path: &PathBuf) -> Result<Vec<u8>> {
            async fn download(url: &str, path: &PathBuf) -> Result<()> {
                let bytes = reqwest::get(url).await?.bytes().await?;
                let mut file = fs::File::create(path).await?;
                file.write_all(&bytes).await?;
                Ok(())
            }

            async fn inflate(path: &PathBuf) -> Result<Vec<u8>> {
                let bytes = fs::read(path).await?;
                // Basic gzip header check (1F 8B)
                if bytes.len() < 2 || bytes[0] != 0x1f || bytes[1] != 0x8b {
                    return Err(anyhow!("Invalid gzip header"));
                }
                let mut decoder = GzDecoder::new(&bytes[..]);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }

            // Try each URL, with one retry per URL on corruption
            for &base in urls {
                let url = format!("{}/{}", base, filename);
                for attempt in 0..2 {
                    // Always re-download on second attempt or if file missing
                    if attempt == 1 || !path.exists() {
                        let _ = fs::remove_file(path).await; // remove any bad file
                        download(&url, path).await?;
                    }
                    match inflate(path).await {
                        Ok(data) => return Ok(data),
                        Err(_) => {
                            if attempt == 0 {
                                continue;
                            } else {
                                let _ = fs::remove_file(path).await;
                                break;
                            }
                        }
                    }
                }
            }

            Err(anyhow!("Failed to download or inflate {}", filename))
        }

        let train_images_path = data_dir.join(TRAIN_IMAGES);
        let train_labels_path = data_dir.join(TRAIN_LABELS);
        let test_images_path = data_dir.join(TEST_IMAGES);
        let test_labels_path = data_dir.join(TEST_LABELS);

        let (train_images_raw, train_labels_raw, test_images_raw, test_labels_raw) = tokio::try_join!(
            fetch_and_inflate(&BASE_URLS, TRAIN_IMAGES, &train_images_path),
            fetch_and_inflate(&BASE_URLS, TRAIN_LABELS, &train_labels_path),
            fetch_and_inflate(&BASE_URLS, TEST_IMAGES, &test_images_path),
            fetch_and_inflate(&BASE_URLS, TEST_LABELS, &test_labels_path),
        )?;

        let train = Partition::new(
            parse_images(&train_images_raw)?,
            parse_labels(&train_labels_raw)?,
        );
        let test = Partition::new(
            parse_images(&test_images_raw)?,
            parse_labels(&test_labels_raw)?,
        );

        info!("Loaded MNIST dataset:");
        info!("  Train: {} examples", train.num_examples());
        info!("  Test: {} examples", test.num_examples());

        Ok(Self { train, test })
    }

    /// Splits train and test sets into per-client IID (train, test) pairs.
    pub fn client_datasets(&self, num_clients: usize) -> Vec<ClientDataset> {
        let train_splits = split_partition(&self.train, num_clients);
        let test_splits = split_partition(&self.test, num_clients);
        train_splits
            .into_iter()
            .zip(test_splits)
            .enumerate()
            .map(|(i, (train, test))| {
                info!(
                    "Client {}: {} train / {} test examples",
                    i,
                    train.num_examples(),
                    test.num_examples()
                );
                ClientDataset { train, test }
            })
            .collect()
    }
}

fn read_u32_be(rdr: &mut std::io::Cursor<&[u8]>) -> Result<u32> {
    Ok(ReadBytesExt::read_u32::<BigEndian>(rdr)?)
}

fn parse_images(bytes: &[u8]) -> Result<Array2<f32>> {
    let mut rdr = std::io::Cursor::new(bytes);
    let magic = read_u32_be(&mut rdr)?;
    if magic != 2051 {
        return Err(anyhow!("Invalid magic for images: {}", magic));
    }
    let num = read_u32_be(&mut rdr)? as usize;
    let rows = read_u32_be(&mut rdr)? as usize;
    let cols = read_u32_be(&mut rdr)? as usize;
    let mut data = vec![0u8; rows * cols * num];
    rdr.read_exact(&mut data)?;
    let images = Array2::from_shape_vec(
        (num, rows * cols),
        data.into_iter().map(|v| v as f32 / 255.0).collect(),
    )?;
    Ok(images)
}

fn parse_labels(bytes: &[u8]) -> Result<Array1<i32>> {
    let mut rdr = std::io::Cursor::new(bytes);
    let magic = read_u32_be(&mut rdr)?;
    if magic != 2049 {
        return Err(anyhow!("Invalid magic for labels: {}", magic));
    }
    let num = read_u32_be(&mut rdr)? as usize;
    let mut data = vec![0u8; num];
    rdr.read_exact(&mut data)?;
    Ok(Array1::from_iter(data.into_iter().map(|v| v as i32)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_all_examples() {
        let data = synthetic_partition(103, 4, 8);
        let splits = split_partition(&data, 4);
        assert_eq!(splits.len(), 4);
        let total: usize = splits.iter().map(|p| p.num_examples()).sum();
        assert_eq!(total, 103);
        // Last client takes the remainder
        assert_eq!(splits[3].num_examples(), 103 - 3 * 25);
    }

    #[test]
    fn split_into_zero_clients_yields_no_partitions() {
        let data = synthetic_partition(10, 2, 4);
        assert!(split_partition(&data, 0).is_empty());
    }

    #[test]
    fn synthetic_labels_are_in_range() {
        let data = synthetic_partition(50, 3, 6);
        assert_eq!(data.num_examples(), 50);
        assert_eq!(data.feature_dim(), 6);
        assert!(data.labels.iter().all(|&l| (0..3).contains(&l)));
    }

    #[test]
    fn empty_partition_reports_empty() {
        let empty = Partition::empty(10);
        assert!(empty.is_empty());
        assert_eq!(empty.feature_dim(), 10);
    }
}
