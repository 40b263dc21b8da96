//! FITS image blocks.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use crossbeam_utils::atomic::AtomicCell;
use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use log::trace;
use ndarray::ArrayView2;

use super::{BlockKind, BlockMetadata, EncodeError, ImageEncoder};

/// Writes each image as a double-precision (`BITPIX = -64`) primary HDU.
///
/// cfitsio wants a file, so each block goes through a scratch file that is
/// read back and removed.
pub struct FitsEncoder {
    scratch_dir: PathBuf,
    counter: AtomicCell<usize>,

    /// cfitsio may not be built reentrant; one block is written at a time.
    cfitsio: Mutex<()>,
}

impl FitsEncoder {
    pub fn new<P: Into<PathBuf>>(scratch_dir: P) -> FitsEncoder {
        FitsEncoder {
            scratch_dir: scratch_dir.into(),
            counter: AtomicCell::new(0),
            cfitsio: Mutex::new(()),
        }
    }

    fn scratch_path(&self, name: &str) -> PathBuf {
        let n = self.counter.fetch_add(1);
        self.scratch_dir
            .join(format!("xcorr-{}-{n}-{name}.fits", std::process::id()))
    }
}

impl ImageEncoder for FitsEncoder {
    fn extension(&self) -> &'static str {
        "fits"
    }

    fn encode(
        &self,
        image: ArrayView2<f64>,
        metadata: &BlockMetadata,
    ) -> Result<Vec<u8>, EncodeError> {
        let (rows, cols) = image.dim();
        if rows == 0 || cols == 0 {
            return Err(EncodeError::Empty(rows, cols));
        }

        let path = self.scratch_path(&metadata.kind.name());
        trace!("Writing scratch FITS {}", path.display());
        let result = {
            let _guard = self.cfitsio.lock().unwrap_or_else(PoisonError::into_inner);
            write_image(&path, image, metadata)
        }
        .and_then(|()| Ok(fs::read(&path)?));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        result
    }
}

fn write_image(
    path: &Path,
    image: ArrayView2<f64>,
    metadata: &BlockMetadata,
) -> Result<(), EncodeError> {
    let (rows, cols) = image.dim();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[rows, cols],
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()?;
    let hdu = fptr.primary_hdu()?;

    // Row-major, one row per tick.
    let samples: Vec<f64> = image.iter().copied().collect();
    hdu.write_image(&mut fptr, &samples)?;

    let cycle = metadata.cycle;
    let (y, mo, d, h, mi, s, _) = cycle.start.to_gregorian_utc();
    hdu.write_key(
        &mut fptr,
        "DATE-OBS",
        format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}"),
    )?;
    hdu.write_key(&mut fptr, "EXPTIME", cycle.duration.to_seconds())?;
    hdu.write_key(&mut fptr, "OBJECT", metadata.kind.name())?;
    hdu.write_key(&mut fptr, "WAVELEN", cycle.wavelength)?;
    hdu.write_key(&mut fptr, "BANDWID", cycle.bandwidth)?;
    hdu.write_key(&mut fptr, "OBJCTRA", cycle.target.ra.to_degrees())?;
    hdu.write_key(&mut fptr, "OBJCTDEC", cycle.target.dec.to_degrees())?;
    hdu.write_key(&mut fptr, "SITELAT", cycle.site.latitude_rad.to_degrees())?;
    hdu.write_key(&mut fptr, "SITELONG", cycle.site.longitude_rad.to_degrees())?;

    match metadata.kind {
        BlockKind::Autocorrelation { line } => {
            hdu.write_key(&mut fptr, "LINE", line as i64 + 1)?;
            hdu.write_key(&mut fptr, "CTYPE1", "LAG")?;
            hdu.write_key(&mut fptr, "CTYPE2", "TICK")?;
            hdu.write_key(&mut fptr, "NTICKS", rows as i64)?;
        }
        BlockKind::Crosscorrelation { first, second } => {
            hdu.write_key(&mut fptr, "LINE1", first as i64 + 1)?;
            hdu.write_key(&mut fptr, "LINE2", second as i64 + 1)?;
            hdu.write_key(&mut fptr, "CTYPE1", "LAG")?;
            hdu.write_key(&mut fptr, "CRPIX1", (cols / 2) as f64 + 1.0)?;
            hdu.write_key(&mut fptr, "CTYPE2", "TICK")?;
            hdu.write_key(&mut fptr, "NTICKS", rows as i64)?;
        }
        BlockKind::Preview => {
            hdu.write_key(&mut fptr, "CTYPE1", "U")?;
            hdu.write_key(&mut fptr, "CTYPE2", "V")?;
        }
    }
    Ok(())
}
