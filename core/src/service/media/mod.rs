//! Profile picture rendering
//!
//! Normalizes an uploaded image into the fixed-size JPEG the profile picture
//! update call expects. Non-square inputs are cropped, never letterboxed:
//! the top-left `min(width, height)` square is taken and scaled to the
//! target canvas, upscaling small sources if necessary.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AvatarError {
	#[error("uploaded image not found: {}", .0.display())]
	NotFound(PathBuf),

	#[error("failed to decode uploaded image: {0}")]
	Decode(image::ImageError),

	#[error("failed to encode profile picture: {0}")]
	Encode(image::ImageError),

	#[error("image task failed: {0}")]
	Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AvatarError>;

/// Render the image at `path` into an `edge`×`edge` JPEG buffer.
///
/// A missing file is reported as [`AvatarError::NotFound`] so the caller can
/// treat it as a soft failure; decode and encode problems surface the same
/// way. Pixel work runs on the blocking pool.
pub async fn render_profile_picture(path: PathBuf, edge: u32) -> Result<Bytes> {
	if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
		return Err(AvatarError::NotFound(path));
	}

	tokio::task::spawn_blocking(move || render_blocking(&path, edge)).await?
}

fn render_blocking(path: &Path, edge: u32) -> Result<Bytes> {
	let img = image::open(path).map_err(AvatarError::Decode)?;

	let (width, height) = img.dimensions();
	let side = width.min(height);
	let square = img.crop_imm(0, 0, side, side);
	let scaled = square.resize_exact(edge, edge, FilterType::Lanczos3);

	let mut out = Cursor::new(Vec::new());
	scaled
		.to_rgb8()
		.write_to(&mut out, ImageFormat::Jpeg)
		.map_err(AvatarError::Encode)?;

	tracing::debug!(
		source = %path.display(),
		width,
		height,
		edge,
		bytes = out.get_ref().len(),
		"rendered profile picture"
	);

	Ok(Bytes::from(out.into_inner()))
}
