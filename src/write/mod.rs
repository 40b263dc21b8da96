//! Turning a finished integration into transportable image blocks.

pub mod fits;

use hifitime::{Duration, Epoch};
use log::{debug, error, info};
use marlu::{LatLngHeight, RADec};
use ndarray::prelude::*;
use rayon::prelude::*;
use thiserror::Error;

use crate::accumulate::FrozenBuffers;

pub use self::fits::FitsEncoder;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("refusing to encode an empty {0}x{1} image")]
    Empty(usize, usize),

    #[error(transparent)]
    Fits(#[from] fitsio::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Autocorrelation { line: usize },
    Crosscorrelation { first: usize, second: usize },
    Preview,
}

impl BlockKind {
    /// The block's name, with 1-based line numbers.
    pub fn name(&self) -> String {
        match self {
            BlockKind::Autocorrelation { line } => format!("AUTOCORRELATIONS_{:02}", line + 1),
            BlockKind::Crosscorrelation { first, second } => {
                format!("CROSSCORRELATIONS_{:02}_{:02}", first + 1, second + 1)
            }
            BlockKind::Preview => "PLOT01".to_string(),
        }
    }
}

/// Metadata shared by every block of one integration.
#[derive(Debug, Clone, Copy)]
pub struct CycleMetadata {
    pub start: Epoch,
    pub duration: Duration,

    /// \[metres\]
    pub wavelength: f64,

    /// \[metres\]
    pub bandwidth: f64,

    pub target: RADec,
    pub site: LatLngHeight,
}

/// A finished integration, detached from the live state.
#[derive(Debug, Clone)]
pub struct FrozenCycle {
    pub buffers: FrozenBuffers,

    /// The line pair of every crosscorrelation buffer, in buffer order.
    pub baseline_pairs: Vec<(usize, usize)>,

    pub metadata: CycleMetadata,
}

/// Everything an encoder may put in a block's header.
#[derive(Debug, Clone, Copy)]
pub struct BlockMetadata<'a> {
    pub kind: BlockKind,
    pub cycle: &'a CycleMetadata,
}

/// One encoded image with the metadata it was made from.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub name: String,

    /// \[rows, columns\]
    pub dims: (usize, usize),

    pub data: Vec<u8>,
}

/// The image-container encoder the serializer delegates to.
pub trait ImageEncoder: Sync {
    /// The file extension of encoded blocks, without the dot.
    fn extension(&self) -> &'static str;

    fn encode(&self, image: ArrayView2<f64>, metadata: &BlockMetadata)
        -> Result<Vec<u8>, EncodeError>;
}

/// The output of one completed integration. A slot is `None` if its buffer
/// was empty or failed to encode.
#[derive(Debug, Clone, Default)]
pub struct IntegrationOutput {
    pub autocorrelations: Vec<Option<Block>>,
    pub crosscorrelations: Vec<Option<Block>>,
    pub preview: Option<Block>,

    /// How many blocks encoding was tried for.
    pub attempted: usize,
    pub failed: usize,
}

impl IntegrationOutput {
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.autocorrelations
            .iter()
            .chain(self.crosscorrelations.iter())
            .chain(std::iter::once(&self.preview))
            .flatten()
    }
}

pub struct Serializer<E> {
    encoder: E,
}

impl<E: ImageEncoder> Serializer<E> {
    pub fn new(encoder: E) -> Serializer<E> {
        Serializer { encoder }
    }

    /// Encode every non-empty buffer of `cycle`, plus the preview. Encoding
    /// failures are logged and leave their slot empty; the rest carry on.
    pub fn serialize(&self, cycle: &FrozenCycle) -> IntegrationOutput {
        let metadata = &cycle.metadata;

        let encode = |kind: BlockKind, image: ArrayView2<f64>| -> Option<Result<Block, ()>> {
            if image.is_empty() && kind != BlockKind::Preview {
                return None;
            }
            let name = kind.name();
            let block_metadata = BlockMetadata {
                kind,
                cycle: metadata,
            };
            Some(match self.encoder.encode(image, &block_metadata) {
                Ok(data) => {
                    debug!("Encoded {name} ({} bytes)", data.len());
                    Ok(Block {
                        kind,
                        name,
                        dims: image.dim(),
                        data,
                    })
                }
                Err(e) => {
                    error!("Couldn't encode {name}: {e}");
                    Err(())
                }
            })
        };

        let autocorrelations: Vec<_> = cycle
            .buffers
            .autocorrelations
            .par_iter()
            .enumerate()
            .map(|(line, image)| encode(BlockKind::Autocorrelation { line }, image.view()))
            .collect();
        let crosscorrelations: Vec<_> = cycle
            .buffers
            .crosscorrelations
            .par_iter()
            .zip(cycle.baseline_pairs.par_iter())
            .map(|(image, &(first, second))| {
                encode(BlockKind::Crosscorrelation { first, second }, image.view())
            })
            .collect();
        let preview = encode(BlockKind::Preview, cycle.buffers.preview.view());

        let mut output = IntegrationOutput::default();
        let mut settle = |slot: Option<Result<Block, ()>>| -> Option<Block> {
            match slot {
                None => None,
                Some(Ok(block)) => {
                    output.attempted += 1;
                    Some(block)
                }
                Some(Err(())) => {
                    output.attempted += 1;
                    output.failed += 1;
                    None
                }
            }
        };
        let autocorrelations = autocorrelations.into_iter().map(&mut settle).collect();
        let crosscorrelations = crosscorrelations.into_iter().map(&mut settle).collect();
        let preview = settle(preview);
        output.autocorrelations = autocorrelations;
        output.crosscorrelations = crosscorrelations;
        output.preview = preview;

        info!(
            "Serialized {} of {} blocks",
            output.attempted - output.failed,
            output.attempted
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes the raw samples as little-endian bytes, failing on request.
    struct RawEncoder {
        fail: Option<BlockKind>,
    }

    impl ImageEncoder for RawEncoder {
        fn extension(&self) -> &'static str {
            "raw"
        }

        fn encode(
            &self,
            image: ArrayView2<f64>,
            metadata: &BlockMetadata,
        ) -> Result<Vec<u8>, EncodeError> {
            if Some(metadata.kind) == self.fail {
                let (r, c) = image.dim();
                return Err(EncodeError::Empty(r, c));
            }
            Ok(image.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
    }

    fn frozen(rows: usize) -> FrozenCycle {
        FrozenCycle {
            buffers: FrozenBuffers {
                autocorrelations: vec![Array2::ones((rows, 4)); 3],
                crosscorrelations: vec![
                    Array2::ones((rows, 7)),
                    Array2::zeros((0, 7)),
                    Array2::ones((rows, 7)),
                ],
                preview: Array2::zeros((128, 128)),
            },
            baseline_pairs: vec![(0, 1), (0, 2), (1, 2)],
            metadata: CycleMetadata {
                start: Epoch::from_gpst_seconds(1_300_000_000.0),
                duration: Duration::from_seconds(2.0),
                wavelength: 0.21,
                bandwidth: 1200.0,
                target: RADec::from_degrees(0.0, 45.0),
                site: LatLngHeight {
                    longitude_rad: 0.0,
                    latitude_rad: 0.5,
                    height_metres: 0.0,
                },
            },
        }
    }

    #[test]
    fn empty_buffers_are_not_attempted() {
        let serializer = Serializer::new(RawEncoder { fail: None });
        let output = serializer.serialize(&frozen(2));
        assert_eq!(output.attempted, 6);
        assert_eq!(output.failed, 0);
        assert!(output.crosscorrelations[1].is_none());
        let block = output.crosscorrelations[2].as_ref().unwrap();
        assert_eq!(block.name, "CROSSCORRELATIONS_02_03");
        assert_eq!(block.dims, (2, 7));
        assert_eq!(block.data.len(), 2 * 7 * 8);
        assert_eq!(output.preview.as_ref().unwrap().name, "PLOT01");
        assert_eq!(output.blocks().count(), 6);
    }

    #[test]
    fn one_failure_does_not_stop_the_rest() {
        let serializer = Serializer::new(RawEncoder {
            fail: Some(BlockKind::Autocorrelation { line: 1 }),
        });
        let output = serializer.serialize(&frozen(3));
        assert_eq!(output.attempted, 6);
        assert_eq!(output.failed, 1);
        assert!(output.autocorrelations[0].is_some());
        assert!(output.autocorrelations[1].is_none());
        assert!(output.autocorrelations[2].is_some());
        assert!(output.preview.is_some());
    }
}
