//! Expansion of the compressed update image into the work area.

use std::fs::{self, File};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tracing::info;

use crate::cmd::Runner;
use crate::error::{Result, ToolError};

/// Decompress `image` into `work_dir`, returning the raw image path.
///
/// `.gz` images are streamed through an in-process decoder. `.xz` images are
/// first copied into the work area and then expanded in place by the
/// external `xz`. Anything else is rejected.
pub fn decompress_image(
    runner: &dyn Runner,
    work_dir: &Utf8Path,
    image: &Utf8Path,
) -> Result<Utf8PathBuf> {
    let file_name = image
        .file_name()
        .ok_or_else(|| ToolError::UnsupportedFormat(image.to_string()))?;
    match image.extension() {
        Some("gz") => {
            info!("decompressing gzip image {image}");
            let output = work_dir.join(file_name.trim_end_matches(".gz"));
            decompress_gzip(image, &output)?;
            Ok(output)
        }
        Some("xz") => {
            info!("decompressing xz image {image}");
            let copied = work_dir.join(file_name);
            fs::copy(image, &copied)?;
            runner.run("xz", &["-d", copied.as_str()])?;
            Ok(work_dir.join(file_name.trim_end_matches(".xz")))
        }
        _ => Err(ToolError::UnsupportedFormat(image.to_string())),
    }
}

fn decompress_gzip(input: &Utf8Path, output: &Utf8Path) -> Result<()> {
    let mut decoder = GzDecoder::new(File::open(input)?);
    let mut out = File::create(output)?;
    io::copy(&mut decoder, &mut out)?;
    Ok(())
}
