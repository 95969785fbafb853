//! Mosaic mask reading and score raster writing.
//!
//! Georeferencing follows GeoTIFF conventions: `ModelPixelScale` and
//! `ModelTiepoint` tags locate the raster, with an ESRI world file (`.tfw`)
//! as fallback. Projection WKT lives in an optional `.prj` sidecar.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use stem_ensemble::{GeoTransform, NODATA, OobMetric, RasterExtent, ScoreMap};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;
use tracing::{debug, info, instrument};

use crate::IoError;

/// A study-area mask with its grid.
#[derive(Debug, Clone)]
pub struct Mosaic {
    /// Raster grid and projection.
    pub extent: RasterExtent,
    /// Row-major validity, `true` where the mosaic pixel is non-zero.
    pub mask: Vec<bool>,
}

/// Files written for one score map.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRasterPaths {
    /// `<stamp>_<metric>.tif`.
    pub score: PathBuf,
    /// `<stamp>_count.tif`.
    pub count: PathBuf,
}

/// Read a single-band mosaic TIFF as a validity mask.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | file is unreadable |
/// | [`IoError::Tiff`] | TIFF decoding failed |
/// | [`IoError::UnsupportedPixelType`] | multi-band or unhandled sample format |
/// | [`IoError::Georeference`] | no usable GeoTIFF tags or world file |
/// | [`IoError::Ensemble`] | the geotransform is not north-up |
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_mosaic(path: &Path) -> Result<Mosaic, IoError> {
    let file = File::open(path).map_err(|e| IoError::FileNotFound {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tiff_err = |e| IoError::Tiff {
        path: path.to_path_buf(),
        source: e,
    };
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(tiff_err)?;
    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    let (width, height) = (width as usize, height as usize);

    let transform = match geotiff_transform(&mut decoder).map_err(tiff_err)? {
        Some(t) => t,
        None => read_world_file(path)?,
    };

    let mask: Vec<bool> = match decoder.read_image().map_err(tiff_err)? {
        DecodingResult::U8(v) => v.into_iter().map(|p| p != 0).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|p| p != 0).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|p| p != 0).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|p| p != 0).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|p| p != 0).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|p| p != 0).collect(),
        DecodingResult::F32(v) => v.into_iter().map(|p| p != 0.0 && !p.is_nan()).collect(),
        DecodingResult::F64(v) => v.into_iter().map(|p| p != 0.0 && !p.is_nan()).collect(),
        _ => {
            return Err(IoError::UnsupportedPixelType {
                path: path.to_path_buf(),
                kind: "64-bit integer".to_string(),
            });
        }
    };
    if mask.len() != width * height {
        return Err(IoError::UnsupportedPixelType {
            path: path.to_path_buf(),
            kind: format!("{} samples per pixel", mask.len() / (width * height).max(1)),
        });
    }

    let projection = read_prj(path);
    let extent = RasterExtent::new(width, height, transform, projection)?;
    let n_valid = mask.iter().filter(|v| **v).count();
    info!(width, height, n_valid, "loaded mosaic mask");
    Ok(Mosaic { extent, mask })
}

fn geotiff_transform<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
) -> tiff::TiffResult<Option<GeoTransform>> {
    let scale = decoder.find_tag(Tag::ModelPixelScaleTag)?;
    let tiepoint = decoder.find_tag(Tag::ModelTiepointTag)?;
    let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
        return Ok(None);
    };
    let scale = scale.into_f64_vec()?;
    let tiepoint = tiepoint.into_f64_vec()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Ok(None);
    }
    // Tiepoint maps raster (i, j) to model (x, y).
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    Ok(Some(GeoTransform {
        origin_x: x - i * scale[0],
        pixel_width: scale[0],
        origin_y: y + j * scale[1],
        pixel_height: -scale[1],
    }))
}

fn world_file_path(path: &Path) -> PathBuf {
    path.with_extension("tfw")
}

fn prj_path(path: &Path) -> PathBuf {
    path.with_extension("prj")
}

/// Parse an ESRI world file. Its origin refers to the centre of the
/// upper-left pixel; the returned origin is that pixel's outer corner.
fn read_world_file(raster: &Path) -> Result<GeoTransform, IoError> {
    let path = world_file_path(raster);
    let text = std::fs::read_to_string(&path).map_err(|_| IoError::Georeference {
        path: raster.to_path_buf(),
        message: format!("no GeoTIFF tags and no world file at {}", path.display()),
    })?;
    let values = text
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IoError::Georeference {
            path: raster.to_path_buf(),
            message: format!("malformed world file {}: {e}", path.display()),
        })?;
    let [a, d, b, e, c, f] = values[..] else {
        return Err(IoError::Georeference {
            path: raster.to_path_buf(),
            message: format!("world file {} has {} values, expected 6", path.display(), values.len()),
        });
    };
    if d != 0.0 || b != 0.0 {
        return Err(IoError::Georeference {
            path: raster.to_path_buf(),
            message: "rotated rasters are not supported".to_string(),
        });
    }
    debug!(path = %path.display(), "georeferenced from world file");
    Ok(GeoTransform {
        origin_x: c - a / 2.0,
        pixel_width: a,
        origin_y: f - e / 2.0,
        pixel_height: e,
    })
}

fn read_prj(raster: &Path) -> Option<String> {
    std::fs::read_to_string(prj_path(raster))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Write the score and count layers of `map` into `dir`.
///
/// Both are 32-bit float GeoTIFFs with nodata [`NODATA`], each accompanied
/// by a world file and, when the mosaic had one, a `.prj`.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::WriteFile`] | a file cannot be created |
/// | [`IoError::Tiff`] | TIFF encoding failed |
#[instrument(skip_all, fields(stamp = %stamp, dir = %dir.display(), metric = metric.as_str()))]
pub fn write_score_map(
    map: &ScoreMap,
    dir: &Path,
    stamp: &str,
    metric: OobMetric,
) -> Result<ScoreRasterPaths, IoError> {
    let paths = ScoreRasterPaths {
        score: dir.join(format!("{stamp}_{}.tif", metric.as_str())),
        count: dir.join(format!("{stamp}_count.tif")),
    };
    write_f32_geotiff(&paths.score, &map.extent, &map.score)?;
    write_f32_geotiff(&paths.count, &map.extent, &map.count)?;
    info!(
        score = %paths.score.display(),
        count = %paths.count.display(),
        "wrote score rasters"
    );
    Ok(paths)
}

fn write_f32_geotiff(path: &Path, extent: &RasterExtent, data: &[f32]) -> Result<(), IoError> {
    let file = File::create(path).map_err(|e| IoError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tiff_err = |e| IoError::Tiff {
        path: path.to_path_buf(),
        source: e,
    };
    let t = extent.transform();
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_err)?;
    let mut image = encoder
        .new_image::<colortype::Gray32Float>(extent.width() as u32, extent.height() as u32)
        .map_err(tiff_err)?;
    let scale = [t.pixel_width, -t.pixel_height, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
    // Version 1.1.0, one key: GTRasterTypeGeoKey = RasterPixelIsArea.
    let geokeys: [u16; 8] = [1, 1, 0, 1, 1025, 0, 1, 1];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])
        .map_err(tiff_err)?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
        .map_err(tiff_err)?;
    image
        .encoder()
        .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])
        .map_err(tiff_err)?;
    image
        .encoder()
        .write_tag(Tag::GdalNodata, format!("{NODATA}").as_str())
        .map_err(tiff_err)?;
    image.write_data(data).map_err(tiff_err)?;

    write_world_file(path, t)?;
    if let Some(wkt) = extent.projection() {
        let prj = prj_path(path);
        std::fs::write(&prj, wkt).map_err(|e| IoError::WriteFile { path: prj, source: e })?;
    }
    Ok(())
}

fn write_world_file(raster: &Path, t: &GeoTransform) -> Result<(), IoError> {
    let path = world_file_path(raster);
    let io_err = |e| IoError::WriteFile {
        path: path.clone(),
        source: e,
    };
    let mut w = BufWriter::new(File::create(&path).map_err(io_err)?);
    writeln!(
        w,
        "{}\n0\n0\n{}\n{}\n{}",
        t.pixel_width,
        t.pixel_height,
        t.origin_x + t.pixel_width / 2.0,
        t.origin_y + t.pixel_height / 2.0,
    )
    .map_err(io_err)?;
    w.flush().map_err(io_err)
}
