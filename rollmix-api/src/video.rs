use anyhow::{Context, Result, ensure};
use candle_core::{DType, Tensor};
use image::{
    Delay, Frame, RgbaImage,
    codecs::gif::{GifEncoder, Repeat},
};
use std::{fs::File, io::BufWriter, path::Path};

/// Encodes a sequence of rendered frames to a file.
pub trait VideoWriter: Send + Sync {
    /// File extension of the written videos, without the dot.
    fn extension(&self) -> &str;

    /// Writes `(t, h, w, c)` u8 frames to `path`.
    fn write(&self, path: &Path, frames: &Tensor, fps: f64) -> Result<()>;
}

/// Writes looping animated GIFs. Accepts RGB and RGBA frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifWriter;

impl VideoWriter for GifWriter {
    fn extension(&self) -> &str {
        "gif"
    }

    fn write(&self, path: &Path, frames: &Tensor, fps: f64) -> Result<()> {
        let (t, h, w, c) = frames.dims4()?;
        ensure!(
            frames.dtype() == DType::U8,
            "expected u8 frames, got {:?}",
            frames.dtype()
        );
        ensure!(c == 3 || c == 4, "expected RGB or RGBA frames, got {c} channels");
        ensure!(h > 0 && w > 0, "expected non empty frames, got {h}x{w} pixels");
        ensure!(fps > 0., "fps must be positive, got {fps}");

        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut encoder = GifEncoder::new(BufWriter::new(file));
        encoder.set_repeat(Repeat::Infinite)?;
        let delay = Delay::from_numer_denom_ms(1000, fps.round().max(1.) as u32);
        let pixels = frames.flatten_all()?.to_vec1::<u8>()?;
        for frame in pixels.chunks_exact(h * w * c).take(t) {
            let rgba = if c == 4 {
                frame.to_vec()
            } else {
                frame
                    .chunks_exact(3)
                    .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], u8::MAX])
                    .collect()
            };
            let buffer = RgbaImage::from_raw(w as u32, h as u32, rgba)
                .context("frame buffer does not match its dimensions")?;
            encoder.encode_frame(Frame::from_parts(buffer, 0, 0, delay))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    #[test]
    fn writes_a_gif() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("episode.gif");
        let frames = Tensor::full(128u8, (3, 6, 8, 3), &Device::Cpu)?;
        GifWriter.write(&path, &frames, 10.)?;
        let bytes = std::fs::read(&path)?;
        assert!(bytes.starts_with(b"GIF89a"));
        Ok(())
    }

    #[test]
    fn rejects_float_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let frames = Tensor::zeros((1, 4, 4, 3), DType::F32, &Device::Cpu)?;
        assert!(GifWriter.write(&dir.path().join("x.gif"), &frames, 10.).is_err());
        Ok(())
    }

    #[test]
    fn rejects_empty_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.gif");
        for shape in [(2, 0, 4, 3), (2, 4, 0, 3)] {
            let frames = Tensor::zeros(shape, DType::U8, &Device::Cpu)?;
            assert!(GifWriter.write(&path, &frames, 10.).is_err());
        }
        assert!(!path.exists());
        Ok(())
    }
}
